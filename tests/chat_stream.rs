use adminhub_server::auth::Principal;
use adminhub_server::chat::{ChatService, ChatStreamItem, HistoryMessage, DEFAULT_TITLE};
use adminhub_server::config::SessionsConfig;
use adminhub_server::llm::{
    spawn_provider_stream, ChatProvider, GenerationOptions, ProviderBinding, ProviderError,
    ProviderFactory, ProviderPartial, ProviderReply, ProviderRequest, ProviderStream,
    ToolInvocation,
};
use adminhub_server::plugins::PluginRegistry;
use adminhub_server::session_pool::SessionPool;
use adminhub_server::tool_results::{serialize_function_result, ToolResult};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
enum Step {
    Emit(ProviderPartial),
    Fail(&'static str),
    Drop,
}

struct ScriptProvider {
    steps: Vec<Step>,
    reply: Option<String>,
}

#[async_trait]
impl ChatProvider for ScriptProvider {
    fn name(&self) -> &str {
        "script"
    }

    async fn stream_chat(&self, _request: ProviderRequest) -> Result<ProviderStream> {
        let steps = self.steps.clone();
        Ok(spawn_provider_stream(move |tx| async move {
            for step in steps {
                let item = match step {
                    Step::Emit(partial) => Ok(partial),
                    Step::Fail(message) => Err(anyhow!(message)),
                    Step::Drop => Err(ProviderError::connection("stream closed").into()),
                };
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        }))
    }

    async fn complete_chat(&self, _request: ProviderRequest) -> Result<ProviderReply> {
        match &self.reply {
            Some(text) => Ok(ProviderReply {
                content: text.clone(),
                finish_reason: Some("stop".to_string()),
            }),
            None => Err(anyhow!("upstream unavailable")),
        }
    }
}

struct ScriptFactory {
    steps: Vec<Step>,
    reply: Option<String>,
}

impl ProviderFactory for ScriptFactory {
    fn create(&self, _principal: &Principal) -> Result<ProviderBinding> {
        Ok(ProviderBinding {
            provider: Arc::new(ScriptProvider {
                steps: self.steps.clone(),
                reply: self.reply.clone(),
            }),
            sanitizer: None,
        })
    }
}

fn chat_service(steps: Vec<Step>, reply: Option<&str>) -> ChatService {
    let pool = SessionPool::new(
        SessionsConfig::default(),
        Arc::new(PluginRegistry::with_plugins(Vec::new())),
        Arc::new(ScriptFactory {
            steps,
            reply: reply.map(str::to_string),
        }),
    );
    ChatService::new(Arc::new(pool))
}

/// 任务被丢弃时置位，用于确认后台生成任务已终止。
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// 发出一段内容后永远挂起的提供方。
struct HangingProvider {
    dropped: Arc<AtomicBool>,
}

#[async_trait]
impl ChatProvider for HangingProvider {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn stream_chat(&self, _request: ProviderRequest) -> Result<ProviderStream> {
        let guard = DropFlag(self.dropped.clone());
        Ok(spawn_provider_stream(move |tx| async move {
            let _guard = guard;
            if tx.send(Ok(ProviderPartial::text("thinking"))).await.is_err() {
                return;
            }
            std::future::pending::<()>().await;
        }))
    }

    async fn complete_chat(&self, _request: ProviderRequest) -> Result<ProviderReply> {
        Err(anyhow!("not used"))
    }
}

struct HangingFactory {
    dropped: Arc<AtomicBool>,
}

impl ProviderFactory for HangingFactory {
    fn create(&self, _principal: &Principal) -> Result<ProviderBinding> {
        Ok(ProviderBinding {
            provider: Arc::new(HangingProvider {
                dropped: self.dropped.clone(),
            }),
            sanitizer: None,
        })
    }
}

fn lookup_call() -> ToolInvocation {
    ToolInvocation {
        name: "http-get".to_string(),
        arguments: json!({ "url": "https://example.com" }),
        result: Some(ToolResult::text("ok")),
    }
}

async fn run_turn(service: &ChatService) -> Vec<ChatStreamItem> {
    service
        .complete_streaming(
            &Principal::new("user-1", "tenant-1"),
            &[HistoryMessage::new("user", "fetch it")],
            None,
            GenerationOptions::default(),
        )
        .await
        .collect()
        .await
}

#[tokio::test]
async fn repeated_tool_invocation_is_emitted_once() {
    let repeated = ProviderPartial {
        content: None,
        finish_reason: Some("tool_calls".to_string()),
        invocations: vec![lookup_call()],
    };
    let service = chat_service(
        vec![
            Step::Emit(repeated.clone()),
            Step::Emit(repeated.clone()),
            Step::Emit(repeated),
            Step::Emit(ProviderPartial::text("done")),
        ],
        None,
    );
    let items = run_turn(&service).await;
    let emitted_calls = items
        .iter()
        .flat_map(|item| item.chunk().function_calls.iter())
        .filter(|call| call.name == "http-get")
        .count();
    assert_eq!(emitted_calls, 1);
    assert_eq!(items[0].chunk().finish_reason.as_deref(), Some("tool_calls"));
    assert_eq!(items[0].chunk().function_calls[0].result, json!("ok"));
    assert!(items.iter().all(|item| !item.is_error()));
    assert_eq!(items.last().map(|item| item.chunk().content.as_str()), Some("done"));
}

#[tokio::test]
async fn mid_stream_failure_ends_with_single_error_chunk() {
    let service = chat_service(
        vec![
            Step::Emit(ProviderPartial::text("partial ")),
            Step::Fail("upstream timeout"),
            Step::Emit(ProviderPartial::text("never seen")),
        ],
        None,
    );
    let items = run_turn(&service).await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].chunk().content, "partial ");
    let errors = items.iter().filter(|item| item.is_error()).count();
    assert_eq!(errors, 1);
    let last = items.last().unwrap();
    assert!(last.is_error());
    assert_eq!(last.chunk().finish_reason.as_deref(), Some("error"));
    assert!(last.chunk().content.contains("upstream timeout"));
    assert_eq!(last.chunk().role, "assistant");
    // 非连接级错误不会让会话出池。
    assert!(service.pool().contains(&Principal::new("user-1", "tenant-1")).await);
}

#[tokio::test]
async fn dropped_connection_evicts_the_session() {
    let service = chat_service(vec![Step::Drop], None);
    let items = run_turn(&service).await;
    assert_eq!(items.len(), 1);
    match &items[0] {
        ChatStreamItem::Error(failure) => assert!(failure.fatal),
        other => panic!("expected error item, got {other:?}"),
    }
    assert!(!service.pool().contains(&Principal::new("user-1", "tenant-1")).await);
}

#[tokio::test]
async fn dropping_the_stream_aborts_the_provider_task() {
    let dropped = Arc::new(AtomicBool::new(false));
    let pool = SessionPool::new(
        SessionsConfig::default(),
        Arc::new(PluginRegistry::with_plugins(Vec::new())),
        Arc::new(HangingFactory {
            dropped: dropped.clone(),
        }),
    );
    let service = ChatService::new(Arc::new(pool));
    let mut stream = service
        .complete_streaming(
            &Principal::new("user-1", "tenant-1"),
            &[HistoryMessage::new("user", "hello")],
            None,
            GenerationOptions::default(),
        )
        .await;
    let first = stream.next().await.unwrap();
    assert_eq!(first.chunk().content, "thinking");
    assert!(!dropped.load(Ordering::SeqCst));

    drop(stream);
    tokio::time::timeout(Duration::from_secs(5), async {
        while !dropped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("provider task was not aborted");
}

#[tokio::test]
async fn title_generation_never_fails() {
    let conversation = [
        HistoryMessage::new("assistant", "How can I help?"),
        HistoryMessage::new("user", "Quarterly revenue by region for the EMEA finance team please"),
    ];
    let failing = chat_service(Vec::new(), None);
    let principal = Principal::new("user-1", "tenant-1");
    let title = failing.generate_title(&principal, &conversation).await;
    assert_eq!(title.chars().count(), 50);
    assert!(title.starts_with("Quarterly revenue by region"));

    let empty = failing.generate_title(&principal, &[]).await;
    assert_eq!(empty, DEFAULT_TITLE);

    let working = chat_service(Vec::new(), Some("\"EMEA Revenue\""));
    assert_eq!(working.generate_title(&principal, &conversation).await, "EMEA Revenue");
}

#[test]
fn nested_unserializable_value_becomes_placeholder() {
    let result = ToolResult::Structured(vec![(
        "outer".to_string(),
        ToolResult::List(vec![ToolResult::Structured(vec![
            ("ok".to_string(), ToolResult::Primitive(json!(1))),
            ("handle".to_string(), ToolResult::opaque("FileHandle", None)),
        ])]),
    )]);
    let value = serialize_function_result(&result);
    assert_eq!(
        value,
        json!({ "outer": [{ "ok": 1, "handle": "<Unserializable FileHandle>" }] })
    );
    let encoded = serde_json::to_string(&value).unwrap();
    let decoded: Value = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, value);
}
