// 对话工作台 API：会话与消息的增删改查，接口均要求调用方身份。
use crate::api::errors::ApiResult;
use crate::api::user_context::resolve_caller;
use crate::services::playground::{MessageInput, SessionCreate};
use crate::state::AppState;
use crate::storage::{ChatMessageRecord, ChatSessionRecord};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::{routing::delete, routing::get, routing::put, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/playground/sessions",
            get(list_sessions).post(create_session),
        )
        .route("/api/playground/sessions/{session_id}", delete(delete_session))
        .route(
            "/api/playground/sessions/{session_id}/messages",
            get(list_messages).post(add_message),
        )
        .route("/api/playground/sessions/{session_id}/title", put(update_title))
        .route(
            "/api/playground/sessions/{session_id}/messages/{message_id}/edit",
            put(edit_message),
        )
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ChatSessionRecord>>> {
    let caller = resolve_caller(&state, &headers).await?;
    Ok(Json(state.playground.list_sessions(&caller.user.id).await?))
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<SessionCreate>,
) -> ApiResult<Json<ChatSessionRecord>> {
    let caller = resolve_caller(&state, &headers).await?;
    Ok(Json(
        state
            .playground
            .create_session(&caller.user.id, payload)
            .await?,
    ))
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Vec<ChatMessageRecord>>> {
    let caller = resolve_caller(&state, &headers).await?;
    Ok(Json(
        state
            .playground
            .list_messages(&caller.user.id, &session_id)
            .await?,
    ))
}

async fn add_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(payload): Json<MessageInput>,
) -> ApiResult<Json<ChatMessageRecord>> {
    let caller = resolve_caller(&state, &headers).await?;
    Ok(Json(
        state
            .playground
            .add_message(&caller.user.id, &session_id, payload)
            .await?,
    ))
}

async fn edit_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((session_id, message_id)): Path<(String, String)>,
    Json(payload): Json<MessageInput>,
) -> ApiResult<Json<ChatMessageRecord>> {
    let caller = resolve_caller(&state, &headers).await?;
    Ok(Json(
        state
            .playground
            .edit_message(&caller.user.id, &session_id, &message_id, payload)
            .await?,
    ))
}

async fn update_title(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let caller = resolve_caller(&state, &headers).await?;
    let title = state
        .playground
        .update_title(&caller.user.id, &caller.principal(), &session_id)
        .await?;
    Ok(Json(json!({ "title": title })))
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let caller = resolve_caller(&state, &headers).await?;
    state
        .playground
        .delete_session(&caller.user.id, &session_id, &caller.audit)
        .await?;
    Ok(Json(json!({ "message": "Session deleted successfully" })))
}
