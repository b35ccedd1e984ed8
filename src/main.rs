// 服务入口：加载配置、初始化日志与应用状态，挂载路由并优雅停机。
use adminhub_server::build_app;
use adminhub_server::config::{load_config, Config};
use adminhub_server::shutdown::shutdown_signal;
use adminhub_server::state::AppState;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    init_tracing(&config);
    let addr = bind_address(&config);
    let state = Arc::new(AppState::new(config)?);
    state.start().await;

    let app = build_app(state.clone());
    let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
    info!("AdminHub 服务已启动: http://{addr}");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        warn!("服务退出异常: {err}");
    }
    state.shutdown().await;
    info!("AdminHub 服务已停止");
    Ok(())
}

fn init_tracing(config: &Config) {
    let default_level = config.observability.log_level.trim();
    let default_level = if default_level.is_empty() {
        "info".to_string()
    } else {
        default_level.to_lowercase()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    if config.observability.log_format.trim().eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn bind_address(config: &Config) -> String {
    // 环境变量优先，便于容器化部署。
    let host = std::env::var("ADMINHUB_HOST").unwrap_or_else(|_| config.server.host.clone());
    let port = std::env::var("ADMINHUB_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(config.server.port);
    format!("{host}:{port}")
}
