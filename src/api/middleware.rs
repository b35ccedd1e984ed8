// 路由中间件：管理密钥校验、panic 兜底与 CORS 规则。
use crate::api::errors::{error_response, error_response_with_code};
use crate::auth;
use crate::config::Config;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use futures::FutureExt;
use std::any::Any as StdAny;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};
use tracing::{error, warn};

/// 管理端路径需要 API Key；未配置密钥时拒绝访问而不是放行。
pub async fn api_key_guard(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    if method == Method::OPTIONS || !auth::is_admin_path(&method, request.uri().path()) {
        return next.run(request).await;
    }
    let Some(expected) = state.config.api_key() else {
        warn!("管理接口被调用但未配置 API Key: {method} {}", request.uri().path());
        return error_response_with_code(
            StatusCode::UNAUTHORIZED,
            Some("UNAUTHORIZED"),
            "Admin API key is not configured",
        );
    };
    let provided = auth::extract_api_key(request.headers()).unwrap_or_default();
    if provided == expected {
        return next.run(request).await;
    }
    error_response_with_code(
        StatusCode::UNAUTHORIZED,
        Some("UNAUTHORIZED"),
        "Invalid API key",
    )
}

pub async fn panic_guard(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let detail = panic_message(panic.as_ref());
            error!("处理请求时发生 panic: {method} {path}: {detail}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

fn panic_message(panic: &(dyn StdAny + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return message.to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}

pub fn build_cors(config: &Config) -> CorsLayer {
    let mut cors = CorsLayer::new();
    let origins = config.cors.allow_origins.as_deref().unwrap_or_default();
    let any_origin = origins.is_empty() || origins.iter().any(|value| value == "*");
    if any_origin {
        cors = cors.allow_origin(Any);
    } else {
        let values = origins
            .iter()
            .filter_map(|value| value.parse().ok())
            .collect::<Vec<_>>();
        if !values.is_empty() {
            cors = cors.allow_origin(AllowOrigin::list(values));
        }
    }

    let methods = config.cors.allow_methods.as_deref().unwrap_or_default();
    if methods.is_empty() || methods.iter().any(|value| value == "*") {
        cors = cors.allow_methods(Any);
    } else {
        let values = methods
            .iter()
            .filter_map(|value| value.parse().ok())
            .collect::<Vec<_>>();
        if !values.is_empty() {
            cors = cors.allow_methods(AllowMethods::list(values));
        }
    }

    let headers = config.cors.allow_headers.as_deref().unwrap_or_default();
    if headers.is_empty() || headers.iter().any(|value| value == "*") {
        cors = cors.allow_headers(Any);
    } else {
        let values = headers
            .iter()
            .filter_map(|value| value.parse().ok())
            .collect::<Vec<_>>();
        if !values.is_empty() {
            cors = cors.allow_headers(AllowHeaders::list(values));
        }
    }

    // 通配来源不能与凭据同时使用。
    if config.cors.allow_credentials.unwrap_or(false) && !any_origin {
        cors = cors.allow_credentials(true);
    }
    cors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_reads_string_payloads() {
        let boxed: Box<dyn StdAny + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn StdAny + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn StdAny + Send> = Box::new(42_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
