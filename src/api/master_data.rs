// 主数据 API：组织、域、环境、受众共用一组路由，按路径段区分维度表。
use crate::api::errors::{ApiError, ApiResult};
use crate::api::user_context::audit_context;
use crate::services::master_data::{MasterCreate, MasterUpdate};
use crate::state::AppState;
use crate::storage::{MasterKind, MasterRecord};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/dm/{entity}", get(list_entities).post(create_entity))
        .route(
            "/api/dm/{entity}/{id}",
            get(get_entity).put(update_entity).delete(delete_entity),
        )
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    #[serde(default)]
    active_only: bool,
}

fn parse_kind(entity: &str) -> ApiResult<MasterKind> {
    MasterKind::from_segment(entity)
        .ok_or_else(|| ApiError::not_found(format!("Unknown master data entity: {entity}")))
}

async fn list_entities(
    State(state): State<Arc<AppState>>,
    Path(entity): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<MasterRecord>>> {
    let kind = parse_kind(&entity)?;
    Ok(Json(state.master_data.list(kind, query.active_only).await?))
}

async fn get_entity(
    State(state): State<Arc<AppState>>,
    Path((entity, id)): Path<(String, String)>,
) -> ApiResult<Json<MasterRecord>> {
    let kind = parse_kind(&entity)?;
    Ok(Json(state.master_data.get(kind, &id).await?))
}

async fn create_entity(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(entity): Path<String>,
    Json(payload): Json<MasterCreate>,
) -> ApiResult<Json<MasterRecord>> {
    let kind = parse_kind(&entity)?;
    let context = audit_context(&state, &headers).await?;
    Ok(Json(state.master_data.create(kind, payload, &context).await?))
}

async fn update_entity(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((entity, id)): Path<(String, String)>,
    Json(payload): Json<MasterUpdate>,
) -> ApiResult<Json<MasterRecord>> {
    let kind = parse_kind(&entity)?;
    let context = audit_context(&state, &headers).await?;
    Ok(Json(state.master_data.update(kind, &id, payload, &context).await?))
}

async fn delete_entity(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((entity, id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let kind = parse_kind(&entity)?;
    let context = audit_context(&state, &headers).await?;
    state.master_data.delete(kind, &id, &context).await?;
    Ok(Json(json!({
        "message": format!("{} deleted successfully", kind.label())
    })))
}
