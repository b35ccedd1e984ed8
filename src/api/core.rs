// 核心 API：健康检查、当前用户与已加载插件清单。
use crate::api::errors::ApiResult;
use crate::api::user_context::resolve_caller;
use crate::state::AppState;
use crate::storage::UserRecord;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/api/me", get(current_user))
        .route("/api/ai/plugins", get(list_plugins))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn current_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<UserRecord>> {
    let caller = resolve_caller(&state, &headers).await?;
    Ok(Json(caller.user))
}

async fn list_plugins(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "initialized": state.registry.is_initialized(),
        "plugins": state.registry.plugin_names(),
        "tools": state.registry.tool_definitions(),
    }))
}
