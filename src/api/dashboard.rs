// 仪表盘 API：会话池指标与按用户移除会话。
use crate::api::errors::{ApiError, ApiResult};
use crate::api::user_context::optional_caller;
use crate::auth::Principal;
use crate::services::session_pool::PoolMetrics;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::{routing::delete, routing::get, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/dashboard/kernel/metrics", get(kernel_metrics))
        .route("/api/dashboard/kernel/{user_id}", delete(remove_kernel))
}

#[derive(Debug, Default, Deserialize)]
struct RemoveQuery {
    #[serde(default)]
    tenant_id: Option<String>,
}

async fn kernel_metrics(State(state): State<Arc<AppState>>) -> Json<PoolMetrics> {
    Json(state.pool.metrics().await)
}

/// 未显式指定租户时，按调用方所在租户定位会话。
async fn remove_kernel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> ApiResult<Json<Value>> {
    let explicit = query
        .tenant_id
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    let tenant_id = match explicit {
        Some(tenant_id) => tenant_id,
        None => optional_caller(&state, &headers)
            .await?
            .map(|caller| caller.user.tenant_id)
            .ok_or_else(|| ApiError::unauthorized("Missing tenant for kernel removal"))?,
    };
    let principal = Principal::new(user_id.trim(), tenant_id);
    if !state.pool.remove(&principal).await {
        return Err(ApiError::not_found(format!(
            "Kernel not found for user {}",
            principal.user_id
        )));
    }
    info!("管理端移除会话: {}", principal.pool_key());
    Ok(Json(json!({
        "success": true,
        "message": format!("Kernel for user {} removed", principal.user_id),
    })))
}
