// MCP 插件：通过 rmcp 流式 HTTP 或子进程 stdio 客户端连接外部工具服务并代理调用。
use crate::config::McpServerConfig;
use crate::services::plugins::{FunctionSpec, Plugin};
use crate::services::tool_results::ToolResult;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rmcp::handler::client::ClientHandler;
use rmcp::model::{CallToolRequestParam, CallToolResult, JsonObject, Tool};
use rmcp::service::{serve_client, Peer, RoleClient, RunningService};
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{StreamableHttpClientTransport, TokioChildProcess};
use serde_json::Value;
use std::borrow::Cow;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const DEFAULT_CONNECT_TIMEOUT_S: u64 = 30;

#[derive(Clone, Default)]
struct NoopClientHandler;

impl ClientHandler for NoopClientHandler {}

pub struct McpPlugin {
    name: String,
    description: String,
    functions: Vec<FunctionSpec>,
    peer: Peer<RoleClient>,
    service: Mutex<Option<RunningService<RoleClient, NoopClientHandler>>>,
}

impl McpPlugin {
    pub async fn connect(server: &McpServerConfig) -> Result<Self> {
        let name = server.name.trim();
        if name.is_empty() {
            return Err(anyhow!("MCP 服务名称不能为空"));
        }
        let connect_timeout = Duration::from_secs(
            server
                .timeout_s
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_S),
        );
        let service = match build_command(server)? {
            Some(command) => {
                let transport = TokioChildProcess::new(command)?;
                info!("启动 MCP 子进程: {name}");
                tokio::time::timeout(connect_timeout, serve_client(NoopClientHandler, transport))
                    .await
                    .map_err(|_| anyhow!("MCP 服务初始化超时: {name}"))??
            }
            None => {
                let transport = build_transport(server)?;
                tokio::time::timeout(connect_timeout, serve_client(NoopClientHandler, transport))
                    .await
                    .map_err(|_| anyhow!("MCP 服务初始化超时: {name}"))??
            }
        };
        let listed = service.list_all_tools().await;
        let tools = match listed {
            Ok(tools) => tools,
            Err(err) => {
                // 工具列表失败时同样回收子进程。
                let _ = service.cancel().await;
                return Err(err.into());
            }
        };
        let functions = collect_functions(server, tools);
        let peer = service.peer().clone();
        Ok(Self {
            name: name.to_string(),
            description: server.description.clone().unwrap_or_default(),
            functions,
            peer,
            service: Mutex::new(Some(service)),
        })
    }
}

#[async_trait]
impl Plugin for McpPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn functions(&self) -> Vec<FunctionSpec> {
        self.functions.clone()
    }

    async fn invoke(&self, function: &str, arguments: &Value) -> Result<ToolResult> {
        debug!("调用 MCP 工具: {}-{function}", self.name);
        let result = self
            .peer
            .call_tool(CallToolRequestParam {
                name: Cow::Owned(function.to_string()),
                arguments: normalize_mcp_arguments(arguments),
            })
            .await?;
        convert_call_result(result)
    }

    async fn close(&self) -> Result<()> {
        let service = self.service.lock().await.take();
        if let Some(service) = service {
            service
                .cancel()
                .await
                .map_err(|err| anyhow!("MCP 连接关闭失败: {}, {err}", self.name))?;
        }
        Ok(())
    }
}

/// 配置了命令时返回子进程命令，否则走 HTTP。
fn build_command(server: &McpServerConfig) -> Result<Option<Command>> {
    let Some(program) = server
        .command
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    else {
        return Ok(None);
    };
    let mut command = Command::new(program);
    command
        .args(&server.args)
        .envs(&server.env)
        .kill_on_drop(true);
    Ok(Some(command))
}

fn build_transport(
    server: &McpServerConfig,
) -> Result<StreamableHttpClientTransport<reqwest::Client>> {
    if server.endpoint.trim().is_empty() {
        return Err(anyhow!("MCP 服务缺少 endpoint 或 command: {}", server.name));
    }
    let mut headers = HeaderMap::new();
    for (key, value) in &server.headers {
        let name = HeaderName::from_bytes(key.as_bytes())?;
        let value = HeaderValue::from_str(value)?;
        headers.insert(name, value);
    }
    let mut builder = reqwest::Client::builder().default_headers(headers);
    if let Some(timeout_s) = server.timeout_s.filter(|value| *value > 0) {
        builder = builder.timeout(Duration::from_secs(timeout_s));
    }
    let client = builder.build()?;
    let http_config = StreamableHttpClientTransportConfig::with_uri(server.endpoint.clone());
    Ok(StreamableHttpClientTransport::with_client(
        client,
        http_config,
    ))
}

fn collect_functions(server: &McpServerConfig, tools: Vec<Tool>) -> Vec<FunctionSpec> {
    let mut items = Vec::new();
    for tool in tools {
        let name = tool.name.to_string();
        if name.is_empty() {
            continue;
        }
        if !server.allow_tools.is_empty() && !server.allow_tools.contains(&name) {
            continue;
        }
        let description = tool.description.as_deref().unwrap_or("").trim().to_string();
        items.push(FunctionSpec {
            name,
            description,
            parameters: tool.schema_as_json_value(),
        });
    }
    items
}

fn normalize_mcp_arguments(args: &Value) -> Option<JsonObject> {
    // MCP 只接受对象参数，其它类型统一视为无参数。
    match args {
        Value::Object(map) => Some(map.clone()),
        _ => None,
    }
}

fn convert_call_result(result: CallToolResult) -> Result<ToolResult> {
    let mut blocks = result
        .content
        .into_iter()
        .map(|block| match serde_json::to_value(&block) {
            Ok(value) => ToolResult::from_value(value),
            Err(err) => {
                warn!("MCP 内容块序列化失败: {err}");
                ToolResult::opaque("McpContent", None)
            }
        })
        .collect::<Vec<_>>();
    let output = match result.structured_content {
        Some(structured) => ToolResult::from_value(structured),
        None if blocks.len() == 1 => blocks.remove(0),
        None => ToolResult::List(blocks),
    };
    if result.is_error.unwrap_or(false) {
        return Err(anyhow!("MCP 工具返回错误: {}", output.as_display_text()));
    }
    Ok(output)
}
