// 调用方上下文：从身份头解析声明、即时建档用户并组装审计上下文。
use crate::api::errors::{ApiError, ApiResult};
use crate::auth::{extract_claims, Principal, PrincipalClaims};
use crate::services::audit::AuditContext;
use crate::state::AppState;
use crate::storage::UserRecord;
use axum::http::header::USER_AGENT;
use axum::http::HeaderMap;

pub struct Caller {
    pub claims: PrincipalClaims,
    pub user: UserRecord,
    pub audit: AuditContext,
}

impl Caller {
    pub fn principal(&self) -> Principal {
        self.claims.principal()
    }
}

/// 必须携带身份；缺失时返回 401。
pub async fn resolve_caller(state: &AppState, headers: &HeaderMap) -> ApiResult<Caller> {
    optional_caller(state, headers)
        .await?
        .ok_or_else(|| ApiError::unauthorized("Missing identity headers"))
}

/// 身份可选；管理接口仅凭 API Key 调用时返回 None。
pub async fn optional_caller(
    state: &AppState,
    headers: &HeaderMap,
) -> ApiResult<Option<Caller>> {
    let Some(claims) = extract_claims(headers, &state.config.auth) else {
        return Ok(None);
    };
    let user = state.users.get_or_create_user(&claims).await?;
    let audit = AuditContext {
        user_id: Some(user.id.clone()),
        tenant_id: Some(user.tenant_id.clone()),
        ..request_audit_context(headers)
    };
    Ok(Some(Caller {
        claims,
        user,
        audit,
    }))
}

pub async fn audit_context(state: &AppState, headers: &HeaderMap) -> ApiResult<AuditContext> {
    Ok(optional_caller(state, headers)
        .await?
        .map(|caller| caller.audit)
        .unwrap_or_else(|| request_audit_context(headers)))
}

pub fn request_audit_context(headers: &HeaderMap) -> AuditContext {
    AuditContext {
        user_id: None,
        tenant_id: None,
        ip_address: client_ip(headers),
        user_agent: headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
    }
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    forwarded
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        })
        .map(str::to_string)
}
