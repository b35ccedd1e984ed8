#![allow(clippy::result_large_err)]
// Library entrypoint for integration tests and internal reuse.
mod api;
mod core;
mod services;
pub mod storage;

pub use api::{build_app, build_router};
pub use core::{auth, config, shutdown, state};
pub use services::{
    audit, builtin_plugins, chat, error, llm, master_data, mcp, model_session, playground, plugins,
    sanitizer, session_pool, settings, tool_results, user_manager,
};
