// 管理端 API：审计日志、租户与用户管理以及用户维度归属。
use crate::api::errors::ApiResult;
use crate::api::user_context::audit_context;
use crate::auth::Principal;
use crate::services::audit::AuditLogPage;
use crate::services::master_data::MasterDataOptions;
use crate::services::user_manager::UserScopeUpdate;
use crate::state::AppState;
use crate::storage::{TenantQuery, TenantRecord, UserQuery, UserRecord};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::{routing::delete, routing::get, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

const DEFAULT_PAGE_LIMIT: i64 = 100;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/admin/audit-logs", get(list_audit_logs))
        .route("/api/admin/tenants", get(list_tenants))
        .route("/api/admin/tenants/count", get(count_tenants))
        .route("/api/admin/tenants/{tenant_id}", delete(delete_tenant))
        .route("/api/admin/users", get(list_users))
        .route("/api/admin/users/count", get(count_users))
        .route("/api/admin/users/master-data-options", get(master_data_options))
        .route(
            "/api/admin/users/{id}",
            delete(delete_user).put(assign_user_scope),
        )
}

#[derive(Debug, Default, Deserialize)]
struct PageQuery {
    #[serde(default)]
    offset: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
}

/// 列表与计数共用的查询参数，`skip`/`limit` 仅对列表生效。
#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default)]
    search: Option<String>,
    #[serde(default)]
    skip: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
}

impl ListQuery {
    fn users(self) -> UserQuery {
        UserQuery {
            tenant_id: non_empty(self.tenant_id),
            search: non_empty(self.search),
            offset: self.skip.unwrap_or(0).max(0),
            limit: self.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
        }
    }

    fn tenants(self) -> TenantQuery {
        TenantQuery {
            search: non_empty(self.search),
            offset: self.skip.unwrap_or(0).max(0),
            limit: self.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

async fn list_audit_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<AuditLogPage>> {
    Ok(Json(state.audit.list(query.offset, query.limit).await?))
}

async fn list_tenants(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<TenantRecord>>> {
    Ok(Json(state.users.list_tenants(query.tenants()).await?))
}

async fn count_tenants(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let count = state.users.count_tenants(non_empty(query.search)).await?;
    Ok(Json(json!({ "count": count })))
}

async fn delete_tenant(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let context = audit_context(&state, &headers).await?;
    state.users.delete_tenant(&tenant_id).await?;
    state
        .audit
        .record(
            &context,
            "delete",
            "tenants",
            Some(tenant_id.trim()),
            json!({ "message": format!("Deleted tenant {}", tenant_id.trim()) }),
        )
        .await;
    Ok(Json(json!({ "message": "Tenant deleted successfully" })))
}

async fn list_users(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<UserRecord>>> {
    Ok(Json(state.users.list_users(query.users()).await?))
}

async fn count_users(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let mut filter = query.users();
    filter.limit = 0;
    let count = state.users.count_users(filter).await?;
    Ok(Json(json!({ "count": count })))
}

async fn master_data_options(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<MasterDataOptions>> {
    Ok(Json(state.master_data.options().await?))
}

/// 删除用户时同时释放其模型会话。
async fn delete_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let context = audit_context(&state, &headers).await?;
    let user = state.users.delete_user(&id).await?;
    state
        .pool
        .remove(&Principal::new(&user.oid, &user.tenant_id))
        .await;
    let label = user
        .display_name
        .clone()
        .or_else(|| user.upn.clone())
        .unwrap_or_else(|| user.oid.clone());
    state
        .audit
        .record(
            &context,
            "delete",
            "users",
            Some(&user.id),
            json!({ "message": format!("Deleted user {label}") }),
        )
        .await;
    Ok(Json(json!({ "message": "User deleted successfully" })))
}

async fn assign_user_scope(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<UserScopeUpdate>,
) -> ApiResult<Json<UserRecord>> {
    Ok(Json(state.users.assign_scope(&id, payload).await?))
}
