// 审计日志：记录主数据与配置项的写操作，写入失败不影响业务请求。
use crate::services::error::ServiceResult;
use crate::services::run_storage;
use crate::storage::{AuditLogRecord, StorageBackend};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

const DEFAULT_PAGE_SIZE: i64 = 100;
const MAX_PAGE_SIZE: i64 = 500;

/// 发起写操作的调用方信息。
#[derive(Debug, Clone, Default)]
pub struct AuditContext {
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl AuditContext {
    pub fn actor(&self) -> Option<String> {
        self.user_id.clone()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditLogPage {
    pub items: Vec<AuditLogRecord>,
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
}

pub struct AuditLogger {
    storage: Arc<dyn StorageBackend>,
}

impl AuditLogger {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    pub async fn record(
        &self,
        context: &AuditContext,
        action: &str,
        resource: &str,
        resource_id: Option<&str>,
        details: Value,
    ) {
        let record = AuditLogRecord {
            id: uuid::Uuid::new_v4().simple().to_string(),
            user_id: context.user_id.clone(),
            tenant_id: context.tenant_id.clone(),
            action: action.to_string(),
            resource: resource.to_string(),
            resource_id: resource_id.map(str::to_string),
            details,
            ip_address: context.ip_address.clone(),
            user_agent: context.user_agent.clone(),
            created_at: now_ts(),
        };
        let result = run_storage(&self.storage, move |storage| storage.append_audit_log(&record)).await;
        if let Err(err) = result {
            warn!("写入审计日志失败: action={action}, resource={resource}, {err}");
        }
    }

    pub async fn list(&self, offset: Option<i64>, limit: Option<i64>) -> ServiceResult<AuditLogPage> {
        let offset = offset.unwrap_or(0).max(0);
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let (items, total) =
            run_storage(&self.storage, move |storage| storage.list_audit_logs(offset, limit)).await?;
        Ok(AuditLogPage {
            items,
            total,
            offset,
            limit,
        })
    }
}

pub(crate) fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
