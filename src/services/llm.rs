// LLM 适配：OpenAI 兼容 / Azure Chat Completions 提供方，流式输出并自动执行工具调用轮次。
use crate::auth::Principal;
use crate::config::{LlmConfig, LlmModelConfig};
use crate::services::plugins::ToolDefinition;
use crate::services::sanitizer::{ContentSanitizer, NegativeNumberSanitizer};
use crate::services::tool_results::{serialize_function_result, ToolResult};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::stream::{BoxStream, Stream};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_AZURE_API_VERSION: &str = "2024-06-01";
const DEFAULT_TIMEOUT_S: u64 = 120;
const MAX_TOOL_ROUNDS: usize = 8;
const STREAM_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Value::String(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    pub fn text(&self) -> &str {
        self.content.as_str().unwrap_or("")
    }
}

/// 单次请求的生成参数，不做持久化。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationOptions {
    pub stream: bool,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub function_calling: bool,
    pub system_message: Option<String>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            stream: true,
            max_tokens: 2000,
            temperature: 0.7,
            top_p: 0.9,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            function_calling: true,
            system_message: None,
        }
    }
}

/// 提供方执行工具时回调的入口，由模型会话提供。
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    fn definitions(&self) -> Vec<ToolDefinition>;

    async fn invoke(&self, name: &str, arguments: &Value) -> Result<ToolResult>;
}

pub struct ProviderRequest {
    pub messages: Vec<ChatMessage>,
    pub options: GenerationOptions,
    pub tools: Option<Arc<dyn ToolInvoker>>,
}

/// 一次工具调用；`result` 为空表示仍在等待参数或结果。
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: Value,
    pub result: Option<ToolResult>,
}

/// 提供方产出的一段增量。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderPartial {
    pub content: Option<String>,
    pub finish_reason: Option<String>,
    pub invocations: Vec<ToolInvocation>,
}

impl ProviderPartial {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn finished(reason: impl Into<String>) -> Self {
        Self {
            finish_reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderReply {
    pub content: String,
    pub finish_reason: Option<String>,
}

pub type ProviderStream = BoxStream<'static, Result<ProviderPartial>>;

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn stream_chat(&self, request: ProviderRequest) -> Result<ProviderStream>;

    async fn complete_chat(&self, request: ProviderRequest) -> Result<ProviderReply>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Connection,
    Timeout,
    Status,
    ContentFilter,
    Decode,
}

#[derive(Debug)]
pub struct ProviderError {
    kind: ProviderErrorKind,
    message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Connection, message)
    }

    pub fn kind(&self) -> ProviderErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        let kind = if err.is_connect() || err.is_body() {
            ProviderErrorKind::Connection
        } else if err.is_timeout() {
            ProviderErrorKind::Timeout
        } else if err.is_decode() {
            ProviderErrorKind::Decode
        } else {
            ProviderErrorKind::Status
        };
        Self::new(kind, format!("LLM transport error: {err}"))
    }

    fn from_status(status: StatusCode, body: &str) -> Self {
        let lowered = body.to_ascii_lowercase();
        if lowered.contains("content_filter") || lowered.contains("content_policy") {
            return Self::new(
                ProviderErrorKind::ContentFilter,
                format!("LLM request rejected by content filter: {status}"),
            );
        }
        Self::new(
            ProviderErrorKind::Status,
            format!("LLM request failed: {status} {}", truncate_text(body, 2048)),
        )
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProviderError {}

/// 判断错误是否意味着底层连接已不可用，需要丢弃会话。
pub fn is_connection_fatal(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(provider) = cause.downcast_ref::<ProviderError>() {
            return provider.kind() == ProviderErrorKind::Connection;
        }
        if let Some(http) = cause.downcast_ref::<reqwest::Error>() {
            return http.is_connect();
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
            );
        }
        false
    })
}

/// 把后台任务的输出通道包装为流，流被丢弃时中止后台任务。
struct TaskStream {
    inner: ReceiverStream<Result<ProviderPartial>>,
    handle: JoinHandle<()>,
}

impl Stream for TaskStream {
    type Item = Result<ProviderPartial>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for TaskStream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn spawn_provider_stream<F, Fut>(producer: F) -> ProviderStream
where
    F: FnOnce(mpsc::Sender<Result<ProviderPartial>>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    let handle = tokio::spawn(producer(tx));
    Box::pin(TaskStream {
        inner: ReceiverStream::new(rx),
        handle,
    })
}

#[derive(Clone)]
pub struct OpenAiProvider {
    http: Client,
    config: LlmModelConfig,
    provider: String,
}

impl OpenAiProvider {
    pub fn new(http: Client, config: LlmModelConfig) -> Self {
        let provider = normalize_provider(config.provider.as_deref());
        Self {
            http,
            config,
            provider,
        }
    }

    fn is_azure(&self) -> bool {
        self.provider == "azure"
    }

    fn endpoint(&self) -> String {
        let base = resolve_base_url(&self.config)
            .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string());
        let base = base.trim_end_matches('/');
        if self.is_azure() {
            let deployment = self
                .config
                .deployment
                .as_deref()
                .or(self.config.model.as_deref())
                .unwrap_or("")
                .trim();
            let version = self
                .config
                .api_version
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .unwrap_or(DEFAULT_AZURE_API_VERSION);
            return format!(
                "{base}/openai/deployments/{deployment}/chat/completions?api-version={version}"
            );
        }
        if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let api_key = self.config.api_key.as_deref().unwrap_or("").trim();
        if api_key.is_empty() {
            return headers;
        }
        if self.is_azure() {
            if let Ok(value) = HeaderValue::from_str(api_key) {
                headers.insert("api-key", value);
            }
        } else if let Ok(value) = format!("Bearer {api_key}").parse() {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }

    /// 模型配置的温度优先于请求参数，输出上限按配置截断。
    fn effective_options(&self, options: &GenerationOptions) -> GenerationOptions {
        let mut effective = options.clone();
        if let Some(temperature) = self.config.temperature {
            effective.temperature = temperature;
        }
        if let Some(max_output) = self.config.max_output.filter(|value| *value > 0) {
            effective.max_tokens = effective.max_tokens.min(max_output);
        }
        effective
    }

    fn build_payload(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
        stream: bool,
        tools: &[Value],
    ) -> Value {
        let options = self.effective_options(options);
        let mut payload = json!({
            "messages": messages,
            "stream": stream,
            "max_tokens": options.max_tokens,
            "temperature": round_f32(options.temperature),
            "top_p": round_f32(options.top_p),
            "frequency_penalty": round_f32(options.frequency_penalty),
            "presence_penalty": round_f32(options.presence_penalty),
        });
        if !self.is_azure() {
            payload["model"] =
                json!(self.config.model.clone().unwrap_or_else(|| "gpt-4o".to_string()));
        }
        if !tools.is_empty() {
            payload["tools"] = Value::Array(tools.to_vec());
            payload["tool_choice"] = json!("auto");
        }
        payload
    }

    async fn send(&self, payload: &Value) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(self.endpoint())
            .headers(self.headers())
            .json(payload)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::from_status(status, &body).into())
    }

    async fn run_stream(
        &self,
        request: ProviderRequest,
        tx: &mpsc::Sender<Result<ProviderPartial>>,
    ) -> Result<()> {
        let tool_values = openai_tools(request.tools.as_deref());
        let mut messages = request.messages;
        for _ in 0..MAX_TOOL_ROUNDS {
            let payload = self.build_payload(&messages, &request.options, true, &tool_values);
            let response = self.send(&payload).await?;
            let mut stream = response.bytes_stream();
            let mut lines = SseLineBuffer::default();
            let mut accumulator: Vec<StreamToolCall> = Vec::new();
            let mut finish_reason: Option<String> = None;
            let mut saw_done = false;
            while let Some(item) = stream.next().await {
                let bytes = item.map_err(ProviderError::from_reqwest)?;
                for line in lines.push(&bytes) {
                    if line.is_empty() || !line.starts_with("data:") {
                        continue;
                    }
                    let data = line.trim_start_matches("data:").trim();
                    if data == "[DONE]" {
                        saw_done = true;
                        break;
                    }
                    let payload = match serde_json::from_str::<Value>(data) {
                        Ok(payload) => payload,
                        Err(err) => {
                            warn!(
                                "LLM stream json parse failed: {err}, data={}",
                                truncate_text(data, 512)
                            );
                            continue;
                        }
                    };
                    let choice = payload
                        .get("choices")
                        .and_then(|value| value.get(0))
                        .cloned()
                        .unwrap_or(Value::Null);
                    if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                        finish_reason = Some(reason.to_string());
                    }
                    let delta = choice.get("delta").cloned().unwrap_or(Value::Null);
                    update_stream_tool_calls(&mut accumulator, &delta);
                    let content = delta.get("content").and_then(Value::as_str).unwrap_or("");
                    if !content.is_empty() && tx.send(Ok(ProviderPartial::text(content))).await.is_err()
                    {
                        return Ok(());
                    }
                }
                if saw_done {
                    break;
                }
            }
            if !saw_done {
                warn!("LLM stream ended without [DONE]");
            }

            let calls = finalize_stream_tool_calls(&accumulator);
            let Some(tools) = request.tools.as_ref().filter(|_| !calls.is_empty()) else {
                let reason = finish_reason.unwrap_or_else(|| "stop".to_string());
                let _ = tx.send(Ok(ProviderPartial::finished(reason))).await;
                return Ok(());
            };

            let pending = ProviderPartial {
                invocations: calls
                    .iter()
                    .map(|call| ToolInvocation {
                        name: call.name.clone(),
                        arguments: call.parsed_arguments(),
                        result: None,
                    })
                    .collect(),
                ..Default::default()
            };
            if tx.send(Ok(pending)).await.is_err() {
                return Ok(());
            }
            let completed = invoke_tool_calls(tools.as_ref(), &calls).await;
            let partial = ProviderPartial {
                finish_reason: Some(finish_reason.unwrap_or_else(|| "tool_calls".to_string())),
                invocations: completed.clone(),
                content: None,
            };
            if tx.send(Ok(partial)).await.is_err() {
                return Ok(());
            }
            append_tool_round(&mut messages, &calls, &completed);
        }
        warn!("LLM 工具调用轮次超过上限: {MAX_TOOL_ROUNDS}");
        let _ = tx.send(Ok(ProviderPartial::finished("stop"))).await;
        Ok(())
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.provider
    }

    async fn stream_chat(&self, request: ProviderRequest) -> Result<ProviderStream> {
        let provider = self.clone();
        Ok(spawn_provider_stream(move |tx| async move {
            if let Err(err) = provider.run_stream(request, &tx).await {
                let _ = tx.send(Err(err)).await;
            }
        }))
    }

    async fn complete_chat(&self, request: ProviderRequest) -> Result<ProviderReply> {
        let tool_values = openai_tools(request.tools.as_deref());
        let mut messages = request.messages;
        for _ in 0..MAX_TOOL_ROUNDS {
            let payload = self.build_payload(&messages, &request.options, false, &tool_values);
            let response = self.send(&payload).await?;
            let body_text = response
                .text()
                .await
                .map_err(ProviderError::from_reqwest)
                .context("read llm response body")?;
            let body = serde_json::from_str::<Value>(&body_text).map_err(|err| {
                ProviderError::new(
                    ProviderErrorKind::Decode,
                    format!(
                        "LLM response parse failed: {err}, body={}",
                        truncate_text(&body_text, 2048)
                    ),
                )
            })?;
            let choice = body
                .get("choices")
                .and_then(|value| value.get(0))
                .cloned()
                .unwrap_or(Value::Null);
            let message = choice.get("message").cloned().unwrap_or(Value::Null);
            let finish_reason = choice
                .get("finish_reason")
                .and_then(Value::as_str)
                .map(str::to_string);
            let mut accumulator = Vec::new();
            update_stream_tool_calls(&mut accumulator, &message);
            let calls = finalize_stream_tool_calls(&accumulator);
            let Some(tools) = request.tools.as_ref().filter(|_| !calls.is_empty()) else {
                let content = message
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                return Ok(ProviderReply {
                    content,
                    finish_reason,
                });
            };
            let completed = invoke_tool_calls(tools.as_ref(), &calls).await;
            append_tool_round(&mut messages, &calls, &completed);
        }
        Err(anyhow!("LLM 工具调用轮次超过上限: {MAX_TOOL_ROUNDS}"))
    }
}

/// 未配置模型时的本地回显提供方，便于开发联调。
pub struct EchoProvider;

impl EchoProvider {
    fn reply_for(messages: &[ChatMessage]) -> String {
        let last = messages
            .iter()
            .rev()
            .find(|message| message.role == "user")
            .map(|message| message.text().to_string())
            .unwrap_or_default();
        format!("Echo: {last}")
    }
}

#[async_trait]
impl ChatProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn stream_chat(&self, request: ProviderRequest) -> Result<ProviderStream> {
        let reply = Self::reply_for(&request.messages);
        Ok(spawn_provider_stream(move |tx| async move {
            for word in reply.split_inclusive(' ') {
                if tx.send(Ok(ProviderPartial::text(word))).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Ok(ProviderPartial::finished("stop"))).await;
        }))
    }

    async fn complete_chat(&self, request: ProviderRequest) -> Result<ProviderReply> {
        Ok(ProviderReply {
            content: Self::reply_for(&request.messages),
            finish_reason: Some("stop".to_string()),
        })
    }
}

/// 会话创建时得到的提供方与其配套的输入净化器。
pub struct ProviderBinding {
    pub provider: Arc<dyn ChatProvider>,
    pub sanitizer: Option<Arc<dyn ContentSanitizer>>,
}

pub trait ProviderFactory: Send + Sync {
    fn create(&self, principal: &Principal) -> Result<ProviderBinding>;
}

/// 按配置中的默认模型构建提供方。
pub struct ConfiguredProviderFactory {
    llm: LlmConfig,
}

impl ConfiguredProviderFactory {
    pub fn new(llm: LlmConfig) -> Self {
        Self { llm }
    }
}

impl ProviderFactory for ConfiguredProviderFactory {
    fn create(&self, principal: &Principal) -> Result<ProviderBinding> {
        let (name, model) = self
            .llm
            .resolve(None)
            .ok_or_else(|| anyhow!("未配置可用的 LLM 模型"))?;
        debug!("为 {} 创建模型连接: {name}", principal.pool_key());
        build_provider(&model)
    }
}

pub fn build_provider(config: &LlmModelConfig) -> Result<ProviderBinding> {
    let provider = normalize_provider(config.provider.as_deref());
    let sanitize = config
        .sanitize_negative_numbers
        .unwrap_or(provider == "azure");
    let sanitizer: Option<Arc<dyn ContentSanitizer>> = if sanitize {
        Some(Arc::new(NegativeNumberSanitizer::new()))
    } else {
        None
    };
    if !is_llm_configured(config) {
        if config.mock_if_unconfigured.unwrap_or(false) {
            return Ok(ProviderBinding {
                provider: Arc::new(EchoProvider),
                sanitizer,
            });
        }
        return Err(anyhow!("LLM 模型未配置 base_url 或 model"));
    }
    let timeout = Duration::from_secs(config.timeout_s.unwrap_or(DEFAULT_TIMEOUT_S).max(5));
    let http = Client::builder().timeout(timeout).build()?;
    Ok(ProviderBinding {
        provider: Arc::new(OpenAiProvider::new(http, config.clone())),
        sanitizer,
    })
}

pub fn is_llm_configured(config: &LlmModelConfig) -> bool {
    let has_base = resolve_base_url(config)
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false);
    let has_model = config
        .model
        .as_deref()
        .or(config.deployment.as_deref())
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false);
    has_base && has_model
}

pub fn normalize_provider(provider: Option<&str>) -> String {
    let raw = provider.unwrap_or("openai_compatible").trim();
    if raw.is_empty() {
        return "openai_compatible".to_string();
    }
    let normalized = raw.to_ascii_lowercase().replace(['-', ' '], "_");
    match normalized.as_str() {
        "openai_compat" | "openai_compatible" => "openai_compatible".to_string(),
        "openai" | "openai_native" => "openai".to_string(),
        "azure" | "azure_openai" | "azureopenai" => "azure".to_string(),
        other => other.to_string(),
    }
}

fn resolve_base_url(config: &LlmModelConfig) -> Option<String> {
    let inline = config
        .base_url
        .as_deref()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty());
    if let Some(value) = inline {
        return Some(value.to_string());
    }
    match normalize_provider(config.provider.as_deref()).as_str() {
        "openai" => Some(DEFAULT_OPENAI_BASE_URL.to_string()),
        _ => None,
    }
}

fn openai_tools(tools: Option<&dyn ToolInvoker>) -> Vec<Value> {
    tools
        .map(|invoker| {
            invoker
                .definitions()
                .iter()
                .map(ToolDefinition::to_openai_tool)
                .collect()
        })
        .unwrap_or_default()
}

async fn invoke_tool_calls(tools: &dyn ToolInvoker, calls: &[StreamToolCall]) -> Vec<ToolInvocation> {
    let mut output = Vec::with_capacity(calls.len());
    for call in calls {
        let arguments = call.parsed_arguments();
        // 工具失败时把错误文本交回模型，由模型决定后续回复。
        let result = match tools.invoke(&call.name, &arguments).await {
            Ok(result) => result,
            Err(err) => ToolResult::Text(format!("Error: {err}")),
        };
        output.push(ToolInvocation {
            name: call.name.clone(),
            arguments,
            result: Some(result),
        });
    }
    output
}

fn append_tool_round(
    messages: &mut Vec<ChatMessage>,
    calls: &[StreamToolCall],
    completed: &[ToolInvocation],
) {
    let tool_calls = calls
        .iter()
        .map(|call| {
            json!({
                "id": call.id,
                "type": "function",
                "function": { "name": call.name, "arguments": call.arguments },
            })
        })
        .collect::<Vec<_>>();
    messages.push(ChatMessage {
        role: "assistant".to_string(),
        content: Value::Null,
        tool_calls: Some(Value::Array(tool_calls)),
        tool_call_id: None,
    });
    for (call, invocation) in calls.iter().zip(completed) {
        let content = invocation
            .result
            .as_ref()
            .map(|result| match serialize_function_result(result) {
                Value::String(text) => text,
                other => other.to_string(),
            })
            .unwrap_or_default();
        messages.push(ChatMessage {
            role: "tool".to_string(),
            content: Value::String(content),
            tool_calls: None,
            tool_call_id: Some(call.id.clone()),
        });
    }
}

/// 按字节缓冲 SSE 数据，只解码完整的行，避免多字节字符被分块截断。
#[derive(Debug, Default)]
struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let Some(last) = self.pending.iter().rposition(|byte| *byte == b'\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        complete
            .split(|byte| *byte == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| String::from_utf8_lossy(line).trim().to_string())
            .collect()
    }
}

#[derive(Debug, Default, Clone)]
struct StreamToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl StreamToolCall {
    fn parsed_arguments(&self) -> Value {
        let trimmed = self.arguments.trim();
        if trimmed.is_empty() {
            return json!({});
        }
        serde_json::from_str::<Value>(trimmed)
            .unwrap_or_else(|_| Value::String(self.arguments.clone()))
    }
}

fn update_stream_tool_calls(acc: &mut Vec<StreamToolCall>, delta: &Value) {
    let tool_calls_raw = delta.get("tool_calls");
    let tool_calls = match tool_calls_raw {
        Some(Value::Array(items)) => Some(items.as_slice()),
        Some(Value::Object(_)) => tool_calls_raw.map(std::slice::from_ref),
        _ => None,
    };
    if let Some(items) = tool_calls {
        for (position, item) in items.iter().enumerate() {
            if let Value::Object(map) = item {
                let index = map
                    .get("index")
                    .and_then(Value::as_u64)
                    .map(|value| value as usize)
                    .unwrap_or(position);
                while acc.len() <= index {
                    acc.push(StreamToolCall::default());
                }
                let slot = &mut acc[index];
                if let Some(id) = map.get("id").and_then(Value::as_str) {
                    slot.id = id.to_string();
                }
                if let Some(function) = map.get("function") {
                    apply_function_delta(slot, function);
                }
            }
        }
    }

    if let Some(function_call) = delta.get("function_call") {
        if acc.is_empty() {
            acc.push(StreamToolCall::default());
        }
        apply_function_delta(&mut acc[0], function_call);
    }
}

fn apply_function_delta(slot: &mut StreamToolCall, function: &Value) {
    if let Value::Object(map) = function {
        if let Some(name) = map.get("name").and_then(Value::as_str) {
            slot.name.push_str(name);
        }
        if let Some(arguments) = map.get("arguments").and_then(Value::as_str) {
            slot.arguments.push_str(arguments);
        }
    }
}

fn finalize_stream_tool_calls(acc: &[StreamToolCall]) -> Vec<StreamToolCall> {
    acc.iter()
        .filter(|call| !call.name.trim().is_empty())
        .enumerate()
        .map(|(index, call)| {
            let mut call = call.clone();
            if call.id.is_empty() {
                call.id = format!("call_{index}");
            }
            call
        })
        .collect()
}

fn round_f32(value: f32) -> f64 {
    const DECIMALS: i32 = 6;
    let factor = 10_f64.powi(DECIMALS);
    ((value as f64) * factor).round() / factor
}

pub(crate) fn truncate_text(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut output = text[..end].to_string();
    output.push_str("...");
    output
}
