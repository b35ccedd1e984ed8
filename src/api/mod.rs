// API 路由汇总入口，按领域拆分以保持结构清晰。
pub mod admin;
pub mod chat;
pub mod core;
pub mod dashboard;
pub mod errors;
pub mod master_data;
pub mod middleware;
pub mod playground;
pub mod settings;
pub mod user_context;

use crate::state::AppState;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::Router;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(core::router())
        .merge(chat::router())
        .merge(playground::router())
        .merge(dashboard::router())
        .merge(settings::router())
        .merge(master_data::router())
        .merge(admin::router())
        .with_state(state)
}

/// 完整应用：由外到内依次为 panic 兜底、请求追踪、CORS 与管理密钥校验。
pub fn build_app(state: Arc<AppState>) -> Router {
    let cors = middleware::build_cors(&state.config);
    build_router(state.clone()).layer(
        ServiceBuilder::new()
            .layer(from_fn(middleware::panic_guard))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(from_fn_with_state(state, middleware::api_key_guard)),
    )
}
