// 退出信号：Ctrl+C 或 SIGTERM 任一到达即触发优雅停机。
use tracing::{info, warn};

pub async fn shutdown_signal() {
    let source = tokio::select! {
        _ = ctrl_c() => "Ctrl+C",
        _ = terminate() => "SIGTERM",
    };
    info!("收到退出信号({source})，停止接收新请求");
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("监听 Ctrl+C 失败: {err}");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(err) => {
            warn!("注册 SIGTERM 监听失败: {err}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
