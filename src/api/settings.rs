// 配置项 API：分层配置的增删改查与按调用方维度解析。
use crate::api::errors::ApiResult;
use crate::api::user_context::{audit_context, optional_caller, request_audit_context};
use crate::services::settings::{ResolveRequest, ResolvedSetting, SettingCreate, SettingUpdate, SettingView};
use crate::state::AppState;
use crate::storage::SettingRecord;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::{routing::get, routing::post, routing::put, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/dm/settings", get(list_settings).post(create_setting))
        .route("/api/dm/settings/resolve", post(resolve_setting))
        .route(
            "/api/dm/settings/{id}",
            put(update_setting).get(get_setting).delete(delete_setting),
        )
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    #[serde(default)]
    key: Option<String>,
}

async fn list_settings(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<SettingView>>> {
    Ok(Json(state.settings.list(query.key).await?))
}

async fn get_setting(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<SettingRecord>> {
    Ok(Json(state.settings.get(&id).await?))
}

async fn create_setting(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<SettingCreate>,
) -> ApiResult<Json<SettingRecord>> {
    let context = audit_context(&state, &headers).await?;
    Ok(Json(state.settings.create(payload, &context).await?))
}

async fn update_setting(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<SettingUpdate>,
) -> ApiResult<Json<SettingRecord>> {
    let context = audit_context(&state, &headers).await?;
    Ok(Json(state.settings.update(&id, payload, &context).await?))
}

async fn delete_setting(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let context = audit_context(&state, &headers).await?;
    state.settings.delete(&id, &context).await?;
    Ok(Json(json!({ "message": "Setting deleted successfully" })))
}

/// 请求未给出 oid 时使用调用方自己的身份；解析本身不会失败。
async fn resolve_setting(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut payload): Json<ResolveRequest>,
) -> ApiResult<Json<ResolvedSetting>> {
    let caller = optional_caller(&state, &headers).await?;
    let has_oid = payload
        .oid
        .as_deref()
        .is_some_and(|value| !value.trim().is_empty());
    if !has_oid {
        payload.oid = caller.as_ref().map(|caller| caller.claims.oid.clone());
    }
    let context = caller
        .map(|caller| caller.audit)
        .unwrap_or_else(|| request_audit_context(&headers));
    Ok(Json(state.settings.resolve(&payload, &context).await))
}
