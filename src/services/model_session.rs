// 模型会话：每个调用方独享一个提供方连接，并绑定共享插件注册表。
use crate::auth::Principal;
use crate::services::llm::{
    ChatProvider, ProviderBinding, ProviderReply, ProviderRequest, ProviderStream, ToolInvoker,
};
use crate::services::plugins::{PluginRegistry, ToolDefinition};
use crate::services::sanitizer::ContentSanitizer;
use crate::services::tool_results::ToolResult;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn ms_to_ts(value: i64) -> f64 {
    value as f64 / 1000.0
}

/// 会话对外展示的快照。
#[derive(Debug, Clone, Serialize)]
pub struct ModelSessionInfo {
    pub id: String,
    pub user_id: String,
    pub tenant_id: String,
    pub provider: String,
    pub created_at: f64,
    pub last_accessed: f64,
    pub access_count: u64,
    pub is_active: bool,
    pub uptime_seconds: f64,
}

pub struct ModelSession {
    id: String,
    principal: Principal,
    created_at_ms: i64,
    last_accessed_ms: AtomicI64,
    access_count: AtomicU64,
    active: AtomicBool,
    provider: Arc<dyn ChatProvider>,
    tools: Arc<SessionTools>,
    sanitizer: Option<Arc<dyn ContentSanitizer>>,
}

impl ModelSession {
    pub fn new(principal: Principal, binding: ProviderBinding, registry: Arc<PluginRegistry>) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let now = now_ms();
        let tools = Arc::new(SessionTools {
            session_id: id.clone(),
            registry,
        });
        Self {
            id,
            principal,
            created_at_ms: now,
            last_accessed_ms: AtomicI64::new(now),
            access_count: AtomicU64::new(0),
            active: AtomicBool::new(true),
            provider: binding.provider,
            tools,
            sanitizer: binding.sanitizer,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn sanitizer(&self) -> Option<&Arc<dyn ContentSanitizer>> {
        self.sanitizer.as_ref()
    }

    pub fn tools(&self) -> Arc<dyn ToolInvoker> {
        self.tools.clone()
    }

    pub fn touch(&self, now_ms: i64) {
        self.last_accessed_ms.fetch_max(now_ms, Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_accessed_ms(&self) -> i64 {
        self.last_accessed_ms.load(Ordering::Relaxed)
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn idle_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.last_accessed_ms())
    }

    pub fn info(&self, now_ms: i64) -> ModelSessionInfo {
        ModelSessionInfo {
            id: self.id.clone(),
            user_id: self.principal.user_id.clone(),
            tenant_id: self.principal.tenant_id.clone(),
            provider: self.provider_name().to_string(),
            created_at: ms_to_ts(self.created_at_ms),
            last_accessed: ms_to_ts(self.last_accessed_ms()),
            access_count: self.access_count(),
            is_active: self.is_active(),
            uptime_seconds: ms_to_ts(now_ms.saturating_sub(self.created_at_ms)),
        }
    }

    /// 流式调用；返回的流被丢弃时提供方任务随之中止。
    pub async fn stream(&self, request: ProviderRequest) -> Result<ProviderStream> {
        self.before_invoke(&request);
        let started = Instant::now();
        let result = self.provider.stream_chat(request).await;
        if let Err(err) = &result {
            self.after_invoke(started, &format!("failed: {err}"));
        }
        result
    }

    pub async fn complete(&self, request: ProviderRequest) -> Result<ProviderReply> {
        self.before_invoke(&request);
        let started = Instant::now();
        let result = self.provider.complete_chat(request).await;
        match &result {
            Ok(_) => self.after_invoke(started, "ok"),
            Err(err) => self.after_invoke(started, &format!("failed: {err}")),
        }
        result
    }

    fn before_invoke(&self, request: &ProviderRequest) {
        let tool_count = request
            .tools
            .as_ref()
            .map(|tools| tools.definitions().len())
            .unwrap_or(0);
        debug!(
            "模型调用开始: session={}, principal={}, messages={}, tools={tool_count}",
            self.id,
            self.principal.pool_key(),
            request.messages.len()
        );
    }

    /// 调用结束后的埋点，流式调用由编排层在流结束时回调。
    pub fn after_invoke(&self, started: Instant, outcome: &str) {
        info!(
            "模型调用结束: session={}, elapsed_ms={}, outcome={outcome}",
            self.id,
            started.elapsed().as_millis()
        );
    }

    /// 释放提供方连接；重复调用无副作用，失败只记录日志。
    pub async fn shutdown(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.provider.close().await {
            warn!(
                "关闭模型会话连接失败: session={}, principal={}, {err}",
                self.id,
                self.principal.pool_key()
            );
        }
        debug!("模型会话已关闭: {}", self.id);
    }
}

/// 会话级工具入口，在共享注册表外包一层调用日志。
pub struct SessionTools {
    session_id: String,
    registry: Arc<PluginRegistry>,
}

#[async_trait]
impl ToolInvoker for SessionTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.tool_definitions()
    }

    async fn invoke(&self, name: &str, arguments: &Value) -> Result<ToolResult> {
        debug!("工具调用开始: session={}, tool={name}", self.session_id);
        let started = Instant::now();
        let result = self.registry.invoke(name, arguments).await;
        let elapsed = started.elapsed().as_millis();
        match &result {
            Ok(_) => info!(
                "工具调用完成: session={}, tool={name}, elapsed_ms={elapsed}",
                self.session_id
            ),
            Err(err) => warn!(
                "工具调用失败: session={}, tool={name}, elapsed_ms={elapsed}, {err}",
                self.session_id
            ),
        }
        result
    }
}
