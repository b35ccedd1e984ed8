// 对话 API：SSE 流式补全、非流式补全与会话标题生成。
use crate::api::errors::{ApiError, ApiResult};
use crate::api::user_context::resolve_caller;
use crate::services::chat::{
    is_content_filter_error, HistoryMessage, ASSISTANT_ROLE, CONTENT_FILTER_MESSAGE,
};
use crate::services::error::ServiceError;
use crate::services::llm::GenerationOptions;
use crate::state::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{routing::post, Json, Router};
use futures::{stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const DONE_SENTINEL: &str = "[DONE]";
const KEEP_ALIVE_INTERVAL_S: u64 = 15;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/ai/chat/completion", post(chat_completion))
        .route("/api/ai/chat/title", post(chat_title))
}

#[derive(Debug, Deserialize)]
struct ChatCompletionRequest {
    messages: Vec<HistoryMessage>,
    #[serde(flatten)]
    options: GenerationOptions,
}

#[derive(Debug, Deserialize)]
struct TitleRequest {
    messages: Vec<HistoryMessage>,
}

async fn chat_completion(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<ChatCompletionRequest>,
) -> ApiResult<Response> {
    if payload.messages.is_empty() {
        return Err(ServiceError::invalid_request("messages are required").into());
    }
    let caller = resolve_caller(&state, &headers).await?;
    let principal = caller.principal();
    state
        .audit
        .record(
            &caller.audit,
            "chat_completion",
            "chat",
            None,
            json!({
                "message": "Chat completion request",
                "message_count": payload.messages.len(),
                "stream": payload.options.stream,
            }),
        )
        .await;

    if payload.options.stream {
        let chunks = state
            .chat
            .complete_streaming(&principal, &payload.messages, None, payload.options)
            .await;
        let events = chunks
            .map(|item| {
                let data = serde_json::to_string(item.chunk()).unwrap_or_default();
                Ok::<Event, Infallible>(Event::default().data(data))
            })
            .chain(stream::once(async {
                Ok::<Event, Infallible>(Event::default().data(DONE_SENTINEL))
            }));
        let sse = Sse::new(events)
            .keep_alive(KeepAlive::new().interval(Duration::from_secs(KEEP_ALIVE_INTERVAL_S)));
        return Ok(sse.into_response());
    }

    match state
        .chat
        .complete_text(&principal, &payload.messages, payload.options)
        .await
    {
        Ok(content) => Ok(Json(json!({ "content": content, "role": ASSISTANT_ROLE })).into_response()),
        Err(err) if is_content_filter_error(&err) => Ok(Json(json!({
            "content": CONTENT_FILTER_MESSAGE,
            "role": ASSISTANT_ROLE,
        }))
        .into_response()),
        Err(err) => {
            warn!("非流式对话失败: principal={}, {err:#}", principal.pool_key());
            Err(ApiError::from(ServiceError::internal(format!(
                "Chat completion failed: {err}"
            ))))
        }
    }
}

async fn chat_title(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<TitleRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let caller = resolve_caller(&state, &headers).await?;
    let title = state
        .chat
        .generate_title(&caller.principal(), &payload.messages)
        .await;
    Ok(Json(json!({ "title": title })))
}
