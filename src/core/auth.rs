// 鉴权辅助：管理端路径保护、API Key 解析与上游身份头提取。
use crate::config::AuthConfig;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};

pub const HEADER_USER_OID: &str = "x-user-oid";
pub const HEADER_TENANT_ID: &str = "x-tenant-id";
pub const HEADER_ISSUER: &str = "x-issuer";
pub const HEADER_USER_NAME: &str = "x-user-name";
pub const HEADER_USER_EMAIL: &str = "x-user-email";
pub const HEADER_USER_UPN: &str = "x-user-upn";
pub const HEADER_USER_ROLES: &str = "x-user-roles";
pub const HEADER_USER_GROUPS: &str = "x-user-groups";

const DEMO_ISSUER: &str = "demo";

/// 已验证的调用方身份，会话池以 (tenant, user) 为键。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub tenant_id: String,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
        }
    }

    pub fn pool_key(&self) -> String {
        format!("{}/{}", self.tenant_id.trim(), self.user_id.trim())
    }
}

/// 上游身份代理注入的声明，供 JIT 建档使用。
#[derive(Debug, Clone, Default)]
pub struct PrincipalClaims {
    pub oid: String,
    pub tenant_id: String,
    pub issuer: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub upn: Option<String>,
    pub roles: Vec<String>,
    pub groups: Vec<String>,
}

impl PrincipalClaims {
    pub fn principal(&self) -> Principal {
        Principal::new(self.oid.clone(), self.tenant_id.clone())
    }
}

pub fn is_admin_path(method: &Method, path: &str) -> bool {
    if path.starts_with("/api/admin") {
        return true;
    }
    if path.starts_with("/api/dashboard/kernel") && method == Method::DELETE {
        return true;
    }
    if path.starts_with("/api/dm") {
        // 解析接口对普通用户开放，其余写操作需要管理密钥。
        if path.starts_with("/api/dm/settings/resolve") {
            return false;
        }
        return method != Method::GET;
    }
    false
}

pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    // 兼容 X-API-Key 与 Authorization: Bearer 的两种格式。
    if let Some(value) = header_text(headers, "x-api-key") {
        return Some(value);
    }
    extract_bearer_token(headers)
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?;
    let text = value.to_str().ok()?.trim();
    let prefix = text.get(..7)?;
    if !prefix.eq_ignore_ascii_case("bearer ") {
        return None;
    }
    let cleaned = text.get(7..)?.trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

pub fn extract_claims(headers: &HeaderMap, auth: &AuthConfig) -> Option<PrincipalClaims> {
    let oid = header_text(headers, HEADER_USER_OID);
    let tenant_id = header_text(headers, HEADER_TENANT_ID);
    match (oid, tenant_id) {
        (Some(oid), Some(tenant_id)) => Some(PrincipalClaims {
            oid,
            tenant_id,
            issuer: header_text(headers, HEADER_ISSUER).unwrap_or_default(),
            display_name: header_text(headers, HEADER_USER_NAME),
            email: header_text(headers, HEADER_USER_EMAIL),
            upn: header_text(headers, HEADER_USER_UPN),
            roles: header_list(headers, HEADER_USER_ROLES),
            groups: header_list(headers, HEADER_USER_GROUPS),
        }),
        _ if auth.demo_mode => Some(demo_claims(auth)),
        _ => None,
    }
}

pub fn demo_claims(auth: &AuthConfig) -> PrincipalClaims {
    PrincipalClaims {
        oid: auth.demo_user_id.clone(),
        tenant_id: auth.demo_tenant_id.clone(),
        issuer: DEMO_ISSUER.to_string(),
        display_name: Some("Demo User".to_string()),
        email: Some("demo@example.com".to_string()),
        upn: Some("demo@example.com".to_string()),
        roles: vec!["Admin".to_string()],
        groups: Vec::new(),
    }
}

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn header_list(headers: &HeaderMap, name: &str) -> Vec<String> {
    header_text(headers, name)
        .map(|text| {
            text.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_is_admin_path() {
        assert!(is_admin_path(&Method::GET, "/api/admin/audit-logs"));
        assert!(is_admin_path(&Method::POST, "/api/dm/settings"));
        assert!(is_admin_path(&Method::DELETE, "/api/dashboard/kernel/u1"));
        assert!(!is_admin_path(&Method::GET, "/api/dm/settings"));
        assert!(!is_admin_path(&Method::POST, "/api/dm/settings/resolve"));
        assert!(!is_admin_path(&Method::POST, "/api/ai/chat/completion"));
        assert!(!is_admin_path(&Method::GET, "/api/dashboard/kernel/metrics"));
    }

    #[test]
    fn bearer_token_requires_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer  abc "));
        assert_eq!(extract_bearer_token(&headers).as_deref(), Some("abc"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(extract_bearer_token(&headers).is_none());
        headers.insert("x-api-key", HeaderValue::from_static("k1"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("k1"));
    }

    #[test]
    fn claims_from_headers_and_demo_fallback() {
        let mut auth = AuthConfig::default();
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_USER_OID, HeaderValue::from_static(" oid-1 "));
        headers.insert(HEADER_TENANT_ID, HeaderValue::from_static("t-1"));
        headers.insert(HEADER_USER_ROLES, HeaderValue::from_static("Admin, Reader,"));
        let claims = extract_claims(&headers, &auth).unwrap();
        assert_eq!(claims.oid, "oid-1");
        assert_eq!(claims.roles, vec!["Admin", "Reader"]);

        let empty = HeaderMap::new();
        let demo = extract_claims(&empty, &auth).unwrap();
        assert_eq!(demo.oid, "demo-user-id");
        assert_eq!(demo.tenant_id, "demo-tenant-id");

        auth.demo_mode = false;
        assert!(extract_claims(&empty, &auth).is_none());
    }

    #[test]
    fn pool_key_trims_both_parts() {
        let principal = Principal::new(" user ", "tenant ");
        assert_eq!(principal.pool_key(), "tenant/user");
    }
}
