// 对话编排：驱动模型会话输出流式增量，统一工具调用结果格式，出错时转为终止块。
use crate::auth::Principal;
use crate::services::llm::{
    is_connection_fatal, ChatMessage, GenerationOptions, ProviderPartial, ProviderRequest,
    ProviderStream,
};
use crate::services::model_session::ModelSession;
use crate::services::sanitizer::ContentSanitizer;
use crate::services::session_pool::SessionPool;
use crate::services::tool_results::serialize_function_result;
use anyhow::Result;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};

pub const ASSISTANT_ROLE: &str = "assistant";
pub const CONTENT_FILTER_MESSAGE: &str =
    "This message has been blocked by the content filter. Please try again with different wording.";
pub const DEFAULT_TITLE: &str = "Chat Conversation";
const TITLE_MAX_CHARS: usize = 50;
const TITLE_EXCERPT_CHARS: usize = 200;
const TITLE_MAX_TOKENS: u32 = 1000;

/// 前端提交的一条历史消息。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

impl HistoryMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FunctionCallView {
    pub name: String,
    pub arguments: Value,
    pub result: Value,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StreamChunk {
    pub content: String,
    pub function_calls: Vec<FunctionCallView>,
    pub finish_reason: Option<String>,
    pub role: &'static str,
}

impl StreamChunk {
    fn new(content: String, function_calls: Vec<FunctionCallView>, finish_reason: Option<String>) -> Self {
        Self {
            content,
            function_calls,
            finish_reason,
            role: ASSISTANT_ROLE,
        }
    }

    fn error(err: &anyhow::Error) -> Self {
        if is_content_filter_error(err) {
            return Self::new(
                CONTENT_FILTER_MESSAGE.to_string(),
                Vec::new(),
                Some("content_filter".to_string()),
            );
        }
        Self::new(format!("Error: {err}"), Vec::new(), Some("error".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamFailure {
    pub chunk: StreamChunk,
    /// 连接级错误，会话已被移出会话池。
    pub fatal: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatStreamItem {
    Data(StreamChunk),
    Error(StreamFailure),
}

impl ChatStreamItem {
    pub fn chunk(&self) -> &StreamChunk {
        match self {
            ChatStreamItem::Data(chunk) => chunk,
            ChatStreamItem::Error(failure) => &failure.chunk,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ChatStreamItem::Error(_))
    }
}

pub type ChatStream = BoxStream<'static, ChatStreamItem>;

pub fn is_content_filter_error(err: &anyhow::Error) -> bool {
    let text = format!("{err:#}").to_lowercase();
    text.contains("content") && (text.contains("filter") || text.contains("policy"))
}

/// 工具调用中的原生结束标记统一为 `tool_calls`。
fn normalize_finish_reason(reason: Option<String>, has_new_calls: bool) -> Option<String> {
    match reason.as_deref() {
        Some("tool_calls" | "function_call" | "tool_use") if has_new_calls => {
            Some("tool_calls".to_string())
        }
        _ => reason,
    }
}

pub fn build_messages(
    history: &[HistoryMessage],
    system_message: Option<&str>,
    sanitizer: Option<&dyn ContentSanitizer>,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    if let Some(system) = system_message.map(str::trim).filter(|value| !value.is_empty()) {
        messages.push(ChatMessage::system(system));
    }
    for message in history {
        match message.role.as_str() {
            "user" => {
                let content = match sanitizer {
                    Some(sanitizer) => sanitizer.sanitize(&message.content).into_owned(),
                    None => message.content.clone(),
                };
                messages.push(ChatMessage::user(content));
            }
            "assistant" => messages.push(ChatMessage::assistant(message.content.clone())),
            _ => {}
        }
    }
    messages
}

struct TurnState {
    inner: Option<ProviderStream>,
    seen: HashSet<(String, String)>,
    session: Arc<ModelSession>,
    pool: Arc<SessionPool>,
    started: Instant,
}

impl TurnState {
    fn absorb(&mut self, partial: ProviderPartial) -> Option<StreamChunk> {
        let mut calls = Vec::new();
        for invocation in partial.invocations {
            // 尚未产出结果的调用不对外暴露。
            let Some(result) = invocation.result else {
                continue;
            };
            let key = (
                invocation.name.clone(),
                serde_json::to_string(&invocation.arguments).unwrap_or_default(),
            );
            if !self.seen.insert(key) {
                continue;
            }
            calls.push(FunctionCallView {
                name: invocation.name,
                arguments: invocation.arguments,
                result: serialize_function_result(&result),
            });
        }
        let content = partial.content.unwrap_or_default();
        if content.is_empty() && calls.is_empty() {
            return None;
        }
        let finish_reason = normalize_finish_reason(partial.finish_reason, !calls.is_empty());
        Some(StreamChunk::new(content, calls, finish_reason))
    }

    async fn fail(&mut self, err: anyhow::Error) -> StreamFailure {
        self.inner = None;
        error!(
            "流式对话失败: session={}, {err:#}",
            self.session.id()
        );
        self.session
            .after_invoke(self.started, &format!("failed: {err}"));
        let fatal = is_connection_fatal(&err);
        if fatal {
            self.pool.remove_session(&self.session).await;
        }
        StreamFailure {
            chunk: StreamChunk::error(&err),
            fatal,
        }
    }
}

fn failure_stream(err: anyhow::Error) -> ChatStream {
    error!("流式对话无法开始: {err:#}");
    let failure = StreamFailure {
        chunk: StreamChunk::error(&err),
        fatal: is_connection_fatal(&err),
    };
    stream::once(async move { ChatStreamItem::Error(failure) }).boxed()
}

pub struct ChatService {
    pool: Arc<SessionPool>,
}

impl ChatService {
    pub fn new(pool: Arc<SessionPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    fn build_request(
        session: &ModelSession,
        history: &[HistoryMessage],
        system_message: Option<&str>,
        options: GenerationOptions,
    ) -> ProviderRequest {
        let sanitizer = session.sanitizer().map(|item| item.as_ref());
        let messages = build_messages(history, system_message, sanitizer);
        let tools = options.function_calling.then(|| session.tools());
        ProviderRequest {
            messages,
            options,
            tools,
        }
    }

    /// 流式对话；所有失败都以流内的单个错误块结束，不会向调用方抛出。
    pub async fn complete_streaming(
        &self,
        principal: &Principal,
        history: &[HistoryMessage],
        system_message: Option<String>,
        options: GenerationOptions,
    ) -> ChatStream {
        let session = match self.pool.acquire(principal).await {
            Ok(session) => session,
            Err(err) => return failure_stream(err),
        };
        let system_message = system_message.or_else(|| options.system_message.clone());
        let request = Self::build_request(&session, history, system_message.as_deref(), options);
        let started = Instant::now();
        let inner = match session.stream(request).await {
            Ok(inner) => inner,
            Err(err) => {
                if is_connection_fatal(&err) {
                    self.pool.remove_session(&session).await;
                }
                return failure_stream(err);
            }
        };
        let state = TurnState {
            inner: Some(inner),
            seen: HashSet::new(),
            session,
            pool: self.pool.clone(),
            started,
        };
        stream::unfold(state, |mut state| async move {
            loop {
                let next = state.inner.as_mut()?.next().await;
                match next {
                    Some(Ok(partial)) => {
                        if let Some(chunk) = state.absorb(partial) {
                            return Some((ChatStreamItem::Data(chunk), state));
                        }
                    }
                    Some(Err(err)) => {
                        let failure = state.fail(err).await;
                        return Some((ChatStreamItem::Error(failure), state));
                    }
                    None => {
                        state.inner = None;
                        state.session.after_invoke(state.started, "ok");
                        return None;
                    }
                }
            }
        })
        .boxed()
    }

    /// 非流式对话，返回完整文本。
    pub async fn complete_text(
        &self,
        principal: &Principal,
        history: &[HistoryMessage],
        options: GenerationOptions,
    ) -> Result<String> {
        let history = history.to_vec();
        self.pool
            .with_session(principal, |session| async move {
                let system_message = options.system_message.clone();
                let mut options = options;
                options.stream = false;
                let request =
                    Self::build_request(&session, &history, system_message.as_deref(), options);
                let reply = session.complete(request).await?;
                Ok(reply.content)
            })
            .await
    }

    /// 生成会话标题，失败时退回首条用户消息或固定标题。
    pub async fn generate_title(&self, principal: &Principal, conversation: &[HistoryMessage]) -> String {
        let prompt = title_prompt(conversation);
        let options = GenerationOptions {
            stream: false,
            max_tokens: TITLE_MAX_TOKENS,
            function_calling: false,
            ..Default::default()
        };
        let history = [HistoryMessage::new("user", prompt)];
        match self.complete_text(principal, &history, options).await {
            Ok(text) => {
                let title = clean_title(&text);
                if title.is_empty() {
                    fallback_title(conversation)
                } else {
                    title
                }
            }
            Err(err) => {
                warn!("生成会话标题失败: {err}");
                fallback_title(conversation)
            }
        }
    }
}

fn title_prompt(conversation: &[HistoryMessage]) -> String {
    let mut text = String::new();
    for message in conversation {
        let content = &message.content;
        if content.chars().count() > TITLE_EXCERPT_CHARS {
            let excerpt = content.chars().take(TITLE_EXCERPT_CHARS).collect::<String>();
            text.push_str(&format!("{}: {excerpt}...\n", message.role));
        } else {
            text.push_str(&format!("{}: {content}\n", message.role));
        }
    }
    format!(
        "Generate a concise, descriptive title (5-8 words max) for this conversation:\n\n{text}\nTitle:"
    )
}

fn clean_title(text: &str) -> String {
    text.trim()
        .trim_matches(|ch| ch == '"' || ch == '\'')
        .trim()
        .chars()
        .take(TITLE_MAX_CHARS)
        .collect()
}

fn fallback_title(conversation: &[HistoryMessage]) -> String {
    conversation
        .iter()
        .find(|message| message.role == "user")
        .map(|message| {
            message
                .content
                .chars()
                .take(TITLE_MAX_CHARS)
                .collect::<String>()
                .trim()
                .to_string()
        })
        .unwrap_or_else(|| DEFAULT_TITLE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionsConfig;
    use crate::services::llm::{
        spawn_provider_stream, ChatProvider, ProviderBinding, ProviderError, ProviderFactory,
        ProviderReply, ToolInvocation,
    };
    use crate::services::plugins::PluginRegistry;
    use crate::services::sanitizer::NegativeNumberSanitizer;
    use crate::services::tool_results::ToolResult;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Clone)]
    enum Step {
        Partial(ProviderPartial),
        Fail(&'static str),
        Disconnect,
    }

    struct ScriptedProvider {
        steps: Vec<Step>,
        seen: Arc<Mutex<Vec<ChatMessage>>>,
        reply: Result<String, &'static str>,
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn stream_chat(&self, request: ProviderRequest) -> Result<ProviderStream> {
            *self.seen.lock() = request.messages;
            let steps = self.steps.clone();
            Ok(spawn_provider_stream(move |tx| async move {
                for step in steps {
                    let item = match step {
                        Step::Partial(partial) => Ok(partial),
                        Step::Fail(message) => Err(anyhow!(message)),
                        Step::Disconnect => Err(ProviderError::connection("socket closed").into()),
                    };
                    if tx.send(item).await.is_err() {
                        return;
                    }
                }
            }))
        }

        async fn complete_chat(&self, request: ProviderRequest) -> Result<ProviderReply> {
            *self.seen.lock() = request.messages;
            assert!(request.tools.is_none());
            match &self.reply {
                Ok(text) => Ok(ProviderReply {
                    content: text.clone(),
                    finish_reason: Some("stop".to_string()),
                }),
                Err(message) => Err(anyhow!(message.to_string())),
            }
        }
    }

    struct ScriptedFactory {
        steps: Vec<Step>,
        seen: Arc<Mutex<Vec<ChatMessage>>>,
        reply: Result<String, &'static str>,
        sanitize: bool,
    }

    impl ProviderFactory for ScriptedFactory {
        fn create(&self, _principal: &Principal) -> Result<ProviderBinding> {
            let sanitizer: Option<Arc<dyn ContentSanitizer>> = if self.sanitize {
                Some(Arc::new(NegativeNumberSanitizer::new()))
            } else {
                None
            };
            Ok(ProviderBinding {
                provider: Arc::new(ScriptedProvider {
                    steps: self.steps.clone(),
                    seen: self.seen.clone(),
                    reply: self.reply.clone(),
                }),
                sanitizer,
            })
        }
    }

    fn build_service(steps: Vec<Step>, reply: Result<String, &'static str>, sanitize: bool) -> (ChatService, Arc<Mutex<Vec<ChatMessage>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let factory = Arc::new(ScriptedFactory {
            steps,
            seen: seen.clone(),
            reply,
            sanitize,
        });
        let pool = SessionPool::new(
            SessionsConfig::default(),
            Arc::new(PluginRegistry::with_plugins(Vec::new())),
            factory,
        );
        (ChatService::new(Arc::new(pool)), seen)
    }

    fn call(name: &str, args: Value, result: Option<&str>) -> ToolInvocation {
        ToolInvocation {
            name: name.to_string(),
            arguments: args,
            result: result.map(ToolResult::text),
        }
    }

    fn principal() -> Principal {
        Principal::new("u1", "t1")
    }

    async fn drain(service: &ChatService) -> Vec<ChatStreamItem> {
        service
            .complete_streaming(
                &principal(),
                &[HistoryMessage::new("user", "hi")],
                None,
                GenerationOptions::default(),
            )
            .await
            .collect()
            .await
    }

    #[tokio::test]
    async fn repeated_invocation_is_emitted_once() {
        let repeated = ProviderPartial {
            invocations: vec![call("math-add", json!({ "a": 1, "b": 2 }), Some("3"))],
            finish_reason: Some("function_call".to_string()),
            content: None,
        };
        let steps = vec![
            Step::Partial(repeated.clone()),
            Step::Partial(repeated.clone()),
            Step::Partial(repeated),
            Step::Partial(ProviderPartial::text("done")),
        ];
        let (service, _) = build_service(steps, Ok(String::new()), false);
        let items = drain(&service).await;
        assert_eq!(items.len(), 2);
        let first = items[0].chunk();
        assert_eq!(first.function_calls.len(), 1);
        assert_eq!(first.function_calls[0].result, json!("3"));
        assert_eq!(first.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(items[1].chunk().content, "done");
    }

    #[tokio::test]
    async fn pending_invocations_and_empty_partials_are_suppressed() {
        let steps = vec![
            Step::Partial(ProviderPartial {
                invocations: vec![call("time-now", json!({}), None)],
                ..Default::default()
            }),
            Step::Partial(ProviderPartial::text("a")),
            Step::Partial(ProviderPartial::finished("stop")),
        ];
        let (service, _) = build_service(steps, Ok(String::new()), false);
        let items = drain(&service).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].chunk().content, "a");
        assert_eq!(items[0].chunk().role, "assistant");
    }

    #[tokio::test]
    async fn mid_stream_failure_ends_with_single_error_chunk() {
        let steps = vec![
            Step::Partial(ProviderPartial::text("partial")),
            Step::Fail("upstream 502"),
            Step::Partial(ProviderPartial::text("never")),
        ];
        let (service, _) = build_service(steps, Ok(String::new()), false);
        let items = drain(&service).await;
        assert_eq!(items.len(), 2);
        assert!(!items[0].is_error());
        let ChatStreamItem::Error(failure) = &items[1] else {
            panic!("expected error item");
        };
        assert!(!failure.fatal);
        assert_eq!(failure.chunk.finish_reason.as_deref(), Some("error"));
        assert_eq!(failure.chunk.content, "Error: upstream 502");
        assert!(service.pool().contains(&principal()).await);
    }

    #[tokio::test]
    async fn content_policy_rejection_is_classified() {
        let steps = vec![Step::Fail("Request blocked by Content management POLICY")];
        let (service, _) = build_service(steps, Ok(String::new()), false);
        let items = drain(&service).await;
        assert_eq!(items.len(), 1);
        let chunk = items[0].chunk();
        assert_eq!(chunk.finish_reason.as_deref(), Some("content_filter"));
        assert_eq!(chunk.content, CONTENT_FILTER_MESSAGE);
    }

    #[tokio::test]
    async fn connection_failure_evicts_session() {
        let (service, _) = build_service(vec![Step::Disconnect], Ok(String::new()), false);
        let items = drain(&service).await;
        let ChatStreamItem::Error(failure) = &items[0] else {
            panic!("expected error item");
        };
        assert!(failure.fatal);
        assert!(!service.pool().contains(&principal()).await);
    }

    #[tokio::test]
    async fn sanitizer_applies_to_user_turns_only() {
        let (service, seen) = build_service(Vec::new(), Ok(String::new()), true);
        let history = [
            HistoryMessage::new("assistant", "it was -3 yesterday"),
            HistoryMessage::new("user", "and -10 today?"),
        ];
        let _ = service
            .complete_streaming(
                &principal(),
                &history,
                Some("be brief".to_string()),
                GenerationOptions::default(),
            )
            .await
            .collect::<Vec<_>>()
            .await;
        let messages = seen.lock().clone();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].text(), "it was -3 yesterday");
        assert_eq!(messages[2].text(), "and minus 10 today?");
    }

    #[tokio::test]
    async fn title_is_trimmed_and_falls_back() {
        let conversation = [
            HistoryMessage::new("system", "ignored"),
            HistoryMessage::new("user", "  How do I rotate the storage account keys for production?"),
        ];
        let (service, seen) = build_service(Vec::new(), Ok("\"Rotating Storage Keys\"".to_string()), false);
        assert_eq!(
            service.generate_title(&principal(), &conversation).await,
            "Rotating Storage Keys"
        );
        assert!(seen.lock()[0].text().ends_with("Title:"));

        let (failing, _) = build_service(Vec::new(), Err("boom"), false);
        let title = failing.generate_title(&principal(), &conversation).await;
        assert_eq!(title, "How do I rotate the storage account keys for pro");
        assert_eq!(
            failing.generate_title(&principal(), &[]).await,
            DEFAULT_TITLE
        );
    }

    #[test]
    fn finish_reason_passes_through_without_new_calls() {
        assert_eq!(
            normalize_finish_reason(Some("function_call".to_string()), false).as_deref(),
            Some("function_call")
        );
        assert_eq!(
            normalize_finish_reason(Some("tool_use".to_string()), true).as_deref(),
            Some("tool_calls")
        );
        assert_eq!(normalize_finish_reason(None, true), None);
    }
}
