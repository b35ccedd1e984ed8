pub mod audit;
pub mod builtin_plugins;
pub mod chat;
pub mod error;
pub mod llm;
pub mod master_data;
pub mod mcp;
pub mod model_session;
pub mod playground;
pub mod plugins;
pub mod sanitizer;
pub mod session_pool;
pub mod settings;
pub mod tool_results;
pub mod user_manager;

use crate::storage::StorageBackend;
use anyhow::{anyhow, Result};
use std::sync::Arc;

/// 在阻塞线程池中执行同步存储操作。
pub(crate) async fn run_storage<T, F>(storage: &Arc<dyn StorageBackend>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn StorageBackend) -> Result<T> + Send + 'static,
{
    let storage = storage.clone();
    tokio::task::spawn_blocking(move || op(storage.as_ref()))
        .await
        .map_err(|err| anyhow!(err.to_string()))?
}
