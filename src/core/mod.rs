pub mod auth;
pub mod config;
pub mod shutdown;
pub mod state;
