// 全局应用状态：集中初始化核心服务并管理依赖注入。

use crate::config::Config;
use crate::services::audit::AuditLogger;
use crate::services::chat::ChatService;
use crate::services::llm::{ConfiguredProviderFactory, ProviderFactory};
use crate::services::master_data::MasterDataService;
use crate::services::playground::PlaygroundService;
use crate::services::plugins::PluginRegistry;
use crate::services::session_pool::SessionPool;
use crate::services::settings::SettingsService;
use crate::services::user_manager::UserManager;
use crate::storage::{build_storage, StorageBackend};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Arc<dyn StorageBackend>,
    pub registry: Arc<PluginRegistry>,
    pub pool: Arc<SessionPool>,
    pub chat: Arc<ChatService>,
    pub playground: Arc<PlaygroundService>,
    pub settings: Arc<SettingsService>,
    pub master_data: Arc<MasterDataService>,
    pub users: Arc<UserManager>,
    pub audit: Arc<AuditLogger>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let factory = Arc::new(ConfiguredProviderFactory::new(config.llm.clone()));
        Self::with_factory(config, factory)
    }

    /// 指定模型提供方工厂，测试时可注入脚本化的提供方。
    pub fn with_factory(config: Config, factory: Arc<dyn ProviderFactory>) -> Result<Self> {
        let storage = build_storage(&config.storage).context("初始化存储失败")?;
        storage.ensure_initialized().context("初始化数据库结构失败")?;
        let registry = Arc::new(PluginRegistry::new(config.plugins.clone()));
        let pool = Arc::new(SessionPool::new(
            config.sessions.clone(),
            registry.clone(),
            factory,
        ));
        let chat = Arc::new(ChatService::new(pool.clone()));
        let audit = Arc::new(AuditLogger::new(storage.clone()));
        let settings = Arc::new(SettingsService::new(storage.clone(), audit.clone()));
        let master_data = Arc::new(MasterDataService::new(storage.clone(), audit.clone()));
        let users = Arc::new(UserManager::new(storage.clone()));
        let playground = Arc::new(PlaygroundService::new(
            storage.clone(),
            audit.clone(),
            chat.clone(),
        ));
        Ok(Self {
            config: Arc::new(config),
            storage,
            registry,
            pool,
            chat,
            playground,
            settings,
            master_data,
            users,
            audit,
        })
    }

    /// 启动后台任务：插件初始化与空闲会话回收。
    pub async fn start(&self) {
        self.pool.start().await;
        info!("插件已加载: {:?}", self.registry.plugin_names());
    }

    /// 关闭所有会话与插件，逐步记录日志，不因单步失败中断。
    pub async fn shutdown(&self) {
        self.pool.stop().await;
    }
}
