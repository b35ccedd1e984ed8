// 存储模块：封装 SQLite 持久化读写，提供租户/用户/主数据/配置项/对话/审计日志的统一接口。

mod sqlite;

use crate::config::StorageConfig;
use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

pub use sqlite::{is_unique_violation, SqliteStorage};

#[derive(Debug, Clone, Serialize)]
pub struct TenantRecord {
    pub tenant_id: String,
    pub name: String,
    pub is_active: bool,
    pub created_at: f64,
    pub updated_at: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    pub id: String,
    pub tenant_id: String,
    pub oid: String,
    pub issuer: String,
    pub display_name: Option<String>,
    pub upn: Option<String>,
    pub email: Option<String>,
    pub roles: Vec<String>,
    pub groups: Vec<String>,
    pub organization_id: Option<String>,
    pub domain_id: Option<String>,
    pub environment_id: Option<String>,
    pub is_active: bool,
    pub created_at: f64,
    pub updated_at: f64,
    pub last_login_at: Option<f64>,
}

/// 主数据的四类维度表，结构一致，仅表名与展示名不同。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MasterKind {
    Organization,
    Domain,
    Environment,
    Audience,
}

impl MasterKind {
    pub const ALL: [MasterKind; 4] = [
        MasterKind::Organization,
        MasterKind::Domain,
        MasterKind::Environment,
        MasterKind::Audience,
    ];

    pub fn table(self) -> &'static str {
        match self {
            MasterKind::Organization => "organizations",
            MasterKind::Domain => "domains",
            MasterKind::Environment => "environments",
            MasterKind::Audience => "audiences",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MasterKind::Organization => "Organization",
            MasterKind::Domain => "Domain",
            MasterKind::Environment => "Environment",
            MasterKind::Audience => "Audience",
        }
    }

    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment.trim().to_ascii_lowercase().as_str() {
            "organizations" | "organization" | "orgs" => Some(MasterKind::Organization),
            "domains" | "domain" => Some(MasterKind::Domain),
            "environments" | "environment" | "envs" => Some(MasterKind::Environment),
            "audiences" | "audience" => Some(MasterKind::Audience),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MasterRecord {
    pub id: String,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_by: Option<String>,
    pub created_at: f64,
    pub updated_by: Option<String>,
    pub updated_at: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettingRecord {
    pub id: String,
    pub key: String,
    pub payload: Value,
    pub description: Option<String>,
    pub is_secret: bool,
    pub organization_id: Option<String>,
    pub domain_id: Option<String>,
    pub environment_id: Option<String>,
    pub audience_id: Option<String>,
    pub specificity: i64,
    pub scope_key: String,
    pub version: i64,
    pub is_active: bool,
    pub created_by: Option<String>,
    pub created_at: f64,
    pub updated_by: Option<String>,
    pub updated_at: f64,
}

/// 列表展示用的维度名称。
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScopeNames {
    pub organization_name: Option<String>,
    pub domain_name: Option<String>,
    pub environment_name: Option<String>,
    pub audience_name: Option<String>,
}

/// 候选查询条件：每个维度要么为空，要么等于调用方的取值。
#[derive(Debug, Clone, Default)]
pub struct SettingCandidateQuery {
    pub key: String,
    pub organization_id: Option<String>,
    pub domain_id: Option<String>,
    pub environment_id: Option<String>,
    pub audience_id: Option<String>,
}

/// 用户列表与计数的过滤条件，`limit` 为 0 表示不分页。
#[derive(Debug, Clone, Default)]
pub struct UserQuery {
    pub tenant_id: Option<String>,
    pub search: Option<String>,
    pub offset: i64,
    pub limit: i64,
}

#[derive(Debug, Clone, Default)]
pub struct TenantQuery {
    pub search: Option<String>,
    pub offset: i64,
    pub limit: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatSessionRecord {
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub created_at: f64,
    pub updated_at: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessageRecord {
    pub id: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub role: String,
    pub content: String,
    pub metadata: Value,
    pub created_at: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditLogRecord {
    pub id: String,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub action: String,
    pub resource: String,
    pub resource_id: Option<String>,
    pub details: Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: f64,
}

pub trait StorageBackend: Send + Sync {
    fn ensure_initialized(&self) -> Result<()>;

    fn get_tenant(&self, tenant_id: &str) -> Result<Option<TenantRecord>>;
    fn insert_tenant(&self, record: &TenantRecord) -> Result<()>;
    fn list_tenants(&self, query: &TenantQuery) -> Result<Vec<TenantRecord>>;
    fn count_tenants(&self, search: Option<&str>) -> Result<i64>;
    fn delete_tenant(&self, tenant_id: &str) -> Result<i64>;

    fn get_user(&self, tenant_id: &str, oid: &str) -> Result<Option<UserRecord>>;
    fn find_user_by_oid(&self, oid: &str) -> Result<Option<UserRecord>>;
    fn get_user_by_id(&self, id: &str) -> Result<Option<UserRecord>>;
    fn list_users(&self, query: &UserQuery) -> Result<Vec<UserRecord>>;
    fn count_users(&self, query: &UserQuery) -> Result<i64>;
    /// 按 (tenant_id, oid) 合并写入，返回库中最终的记录。
    fn upsert_user(&self, record: &UserRecord) -> Result<UserRecord>;
    /// 删除用户及其对话会话与消息。
    fn delete_user(&self, id: &str) -> Result<i64>;

    fn list_master(&self, kind: MasterKind, active_only: bool) -> Result<Vec<MasterRecord>>;
    fn get_master(&self, kind: MasterKind, id: &str) -> Result<Option<MasterRecord>>;
    fn get_master_by_code(&self, kind: MasterKind, code: &str) -> Result<Option<MasterRecord>>;
    fn insert_master(&self, kind: MasterKind, record: &MasterRecord) -> Result<()>;
    fn update_master(&self, kind: MasterKind, record: &MasterRecord) -> Result<()>;
    fn delete_master(&self, kind: MasterKind, id: &str) -> Result<i64>;

    fn list_settings(&self, key: Option<&str>) -> Result<Vec<(SettingRecord, ScopeNames)>>;
    fn get_setting(&self, id: &str) -> Result<Option<SettingRecord>>;
    fn get_setting_by_scope(&self, key: &str, scope_key: &str) -> Result<Option<SettingRecord>>;
    fn insert_setting(&self, record: &SettingRecord) -> Result<()>;
    fn update_setting(&self, record: &SettingRecord) -> Result<()>;
    fn delete_setting(&self, id: &str) -> Result<i64>;
    fn query_setting_candidates(&self, query: &SettingCandidateQuery)
        -> Result<Vec<SettingRecord>>;

    fn insert_chat_session(&self, record: &ChatSessionRecord) -> Result<()>;
    fn get_chat_session(&self, id: &str, user_id: &str) -> Result<Option<ChatSessionRecord>>;
    fn list_chat_sessions(&self, user_id: &str) -> Result<Vec<ChatSessionRecord>>;
    fn update_chat_session(&self, record: &ChatSessionRecord) -> Result<()>;
    /// 删除会话及其全部消息，返回删除的消息数。
    fn delete_chat_session(&self, id: &str) -> Result<i64>;
    fn list_chat_messages(&self, session_id: &str, limit: Option<i64>)
        -> Result<Vec<ChatMessageRecord>>;
    fn get_chat_message(&self, session_id: &str, id: &str) -> Result<Option<ChatMessageRecord>>;
    /// 写入消息并刷新会话更新时间。
    fn insert_chat_message(&self, message: &ChatMessageRecord) -> Result<()>;
    /// 删除 `from_id` 及其之后的消息，再写入替换消息；`from_id` 不存在时返回 false。
    fn replace_chat_messages_from(&self, from_id: &str, message: &ChatMessageRecord)
        -> Result<bool>;

    fn append_audit_log(&self, record: &AuditLogRecord) -> Result<()>;
    fn list_audit_logs(&self, offset: i64, limit: i64) -> Result<(Vec<AuditLogRecord>, i64)>;
}

pub fn build_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    let backend = config.backend.trim().to_lowercase();
    let backend = if backend.is_empty() {
        "sqlite".to_string()
    } else {
        backend
    };
    match backend.as_str() {
        "sqlite" | "default" => Ok(Arc::new(SqliteStorage::new(
            config.db_path.trim().to_string(),
        ))),
        other => Err(anyhow!("未知存储后端: {other}")),
    }
}
