// 插件注册表：进程级共享的工具能力集合，初始化一次后只读。
use crate::config::PluginsConfig;
use crate::services::builtin_plugins::{HttpPlugin, MathPlugin, TimePlugin};
use crate::services::mcp::McpPlugin;
use crate::services::tool_results::ToolResult;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// 插件暴露给模型的单个函数。
#[derive(Debug, Clone, Serialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 注册后的工具定义，名称形如 `math-add`。
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn to_openai_tool(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn functions(&self) -> Vec<FunctionSpec>;

    async fn invoke(&self, function: &str, arguments: &Value) -> Result<ToolResult>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct PluginRegistry {
    config: PluginsConfig,
    plugins: OnceCell<Vec<Arc<dyn Plugin>>>,
    closed: AtomicBool,
}

impl PluginRegistry {
    pub fn new(config: PluginsConfig) -> Self {
        Self {
            config,
            plugins: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// 直接使用给定插件，跳过配置装配。
    pub fn with_plugins(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self {
            config: PluginsConfig::default(),
            plugins: OnceCell::new_with(Some(plugins)),
            closed: AtomicBool::new(false),
        }
    }

    /// 并发调用只会装配一次，之后的调用直接返回。
    pub async fn init(&self) -> &[Arc<dyn Plugin>] {
        let plugins = self
            .plugins
            .get_or_init(|| async { build_plugins(&self.config).await })
            .await;
        plugins.as_slice()
    }

    pub fn is_initialized(&self) -> bool {
        self.plugins.initialized()
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        self.plugins
            .get()
            .map(|items| items.as_slice())
            .unwrap_or(&[])
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins()
            .iter()
            .map(|plugin| plugin.name().to_string())
            .collect()
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut output = Vec::new();
        for plugin in self.plugins() {
            for function in plugin.functions() {
                output.push(ToolDefinition {
                    name: qualified_name(plugin.name(), &function.name),
                    description: function.description,
                    parameters: function.parameters,
                });
            }
        }
        output
    }

    pub async fn invoke(&self, tool_name: &str, arguments: &Value) -> Result<ToolResult> {
        for plugin in self.plugins() {
            let prefix = format!("{}-", plugin.name());
            let Some(function) = tool_name.strip_prefix(&prefix) else {
                continue;
            };
            if plugin.functions().iter().any(|spec| spec.name == function) {
                return plugin.invoke(function, arguments).await;
            }
        }
        Err(anyhow!("未注册的工具: {tool_name}"))
    }

    /// 逐个关闭插件，单个失败只记录日志。
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for plugin in self.plugins() {
            if let Err(err) = plugin.close().await {
                warn!("关闭插件失败: {}, {err}", plugin.name());
            }
        }
        info!("插件注册表已关闭");
    }
}

pub fn qualified_name(plugin: &str, function: &str) -> String {
    format!("{plugin}-{function}")
}

async fn build_plugins(config: &PluginsConfig) -> Vec<Arc<dyn Plugin>> {
    let mut plugins: Vec<Arc<dyn Plugin>> = Vec::new();
    for name in &config.builtin {
        match name.trim().to_ascii_lowercase().as_str() {
            "math" => plugins.push(Arc::new(MathPlugin)),
            "time" => plugins.push(Arc::new(TimePlugin)),
            "http" => match HttpPlugin::new(config.http_timeout_s) {
                Ok(plugin) => plugins.push(Arc::new(plugin)),
                Err(err) => warn!("HTTP 插件初始化失败: {err}"),
            },
            other => warn!("忽略未知内置插件: {other}"),
        }
    }
    for server in config.mcp_servers.iter().filter(|server| server.enabled) {
        match McpPlugin::connect(server).await {
            Ok(plugin) => {
                info!(
                    "MCP 插件已连接: {}, tools={}",
                    server.name,
                    plugin.functions().len()
                );
                plugins.push(Arc::new(plugin));
            }
            Err(err) => warn!("MCP 插件连接失败，已跳过: {}, {err}", server.name),
        }
    }
    info!("插件注册表初始化完成: {} 个插件", plugins.len());
    plugins
}
