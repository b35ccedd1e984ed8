// SQLite 存储实现：租户、用户、主数据、配置项、对话与审计日志。
use crate::storage::{
    AuditLogRecord, ChatMessageRecord, ChatSessionRecord, MasterKind, MasterRecord, ScopeNames,
    SettingCandidateQuery, SettingRecord, StorageBackend, TenantQuery, TenantRecord, UserQuery,
    UserRecord,
};
use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

const USER_COLUMNS: &str = "id, tenant_id, oid, issuer, display_name, upn, email, roles, group_ids, \
     organization_id, domain_id, environment_id, is_active, created_at, updated_at, last_login_at";

const MASTER_COLUMNS: &str =
    "id, code, name, description, is_active, created_by, created_at, updated_by, updated_at";

const SETTING_COLUMNS: &str = "s.id, s.setting_key, s.payload, s.description, s.is_secret, \
     s.organization_id, s.domain_id, s.environment_id, s.audience_id, s.specificity, s.scope_key, \
     s.version, s.is_active, s.created_by, s.created_at, s.updated_by, s.updated_at";

const TENANT_COLUMNS: &str = "tenant_id, name, is_active, created_at, updated_at";

const CHAT_SESSION_COLUMNS: &str = "id, user_id, title, created_at, updated_at";

const CHAT_MESSAGE_COLUMNS: &str = "id, session_id, user_id, role, content, metadata, created_at";

const AUDIT_COLUMNS: &str = "id, user_id, tenant_id, action, resource, resource_id, details, \
     ip_address, user_agent, created_at";

/// 判断错误是否来自唯一约束冲突，供业务层转换为请求错误。
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(code, _))
                if code.code == rusqlite::ErrorCode::ConstraintViolation
        )
    })
}

pub struct SqliteStorage {
    db_path: PathBuf,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
}

impl SqliteStorage {
    pub fn new(db_path: String) -> Self {
        let path = if db_path.trim().is_empty() {
            PathBuf::from("./data/adminhub.db")
        } else {
            PathBuf::from(db_path)
        };
        Self {
            db_path: path,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
        }
    }

    fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    fn open(&self) -> Result<Connection> {
        self.ensure_db_dir()?;
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Ok(conn)
    }

    fn json_to_string(value: &Value) -> String {
        serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
    }

    fn json_from_str(text: Option<String>) -> Value {
        text.filter(|value| !value.trim().is_empty())
            .and_then(|value| serde_json::from_str::<Value>(&value).ok())
            .unwrap_or(Value::Null)
    }

    fn parse_string_list(value: Option<String>) -> Vec<String> {
        let Some(raw) = value else {
            return Vec::new();
        };
        serde_json::from_str::<Vec<String>>(raw.trim()).unwrap_or_default()
    }

    fn string_list_to_json(list: &[String]) -> String {
        serde_json::to_string(list).unwrap_or_else(|_| "[]".to_string())
    }

    fn flag(value: bool) -> i64 {
        if value {
            1
        } else {
            0
        }
    }

    fn map_user(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
        Ok(UserRecord {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            oid: row.get(2)?,
            issuer: row.get(3)?,
            display_name: row.get(4)?,
            upn: row.get(5)?,
            email: row.get(6)?,
            roles: Self::parse_string_list(row.get::<_, Option<String>>(7)?),
            groups: Self::parse_string_list(row.get::<_, Option<String>>(8)?),
            organization_id: row.get(9)?,
            domain_id: row.get(10)?,
            environment_id: row.get(11)?,
            is_active: row.get::<_, i64>(12)? != 0,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
            last_login_at: row.get(15)?,
        })
    }

    fn map_master(row: &Row<'_>) -> rusqlite::Result<MasterRecord> {
        Ok(MasterRecord {
            id: row.get(0)?,
            code: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            is_active: row.get::<_, i64>(4)? != 0,
            created_by: row.get(5)?,
            created_at: row.get(6)?,
            updated_by: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn map_setting(row: &Row<'_>) -> rusqlite::Result<SettingRecord> {
        Ok(SettingRecord {
            id: row.get(0)?,
            key: row.get(1)?,
            payload: Self::json_from_str(row.get::<_, Option<String>>(2)?),
            description: row.get(3)?,
            is_secret: row.get::<_, i64>(4)? != 0,
            organization_id: row.get(5)?,
            domain_id: row.get(6)?,
            environment_id: row.get(7)?,
            audience_id: row.get(8)?,
            specificity: row.get(9)?,
            scope_key: row.get(10)?,
            version: row.get(11)?,
            is_active: row.get::<_, i64>(12)? != 0,
            created_by: row.get(13)?,
            created_at: row.get(14)?,
            updated_by: row.get(15)?,
            updated_at: row.get(16)?,
        })
    }

    fn map_tenant(row: &Row<'_>) -> rusqlite::Result<TenantRecord> {
        Ok(TenantRecord {
            tenant_id: row.get(0)?,
            name: row.get(1)?,
            is_active: row.get::<_, i64>(2)? != 0,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    fn map_chat_session(row: &Row<'_>) -> rusqlite::Result<ChatSessionRecord> {
        Ok(ChatSessionRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    fn map_chat_message(row: &Row<'_>) -> rusqlite::Result<ChatMessageRecord> {
        Ok(ChatMessageRecord {
            id: row.get(0)?,
            session_id: row.get(1)?,
            user_id: row.get(2)?,
            role: row.get(3)?,
            content: row.get(4)?,
            metadata: Self::json_from_str(row.get::<_, Option<String>>(5)?),
            created_at: row.get(6)?,
        })
    }

    fn like_pattern(search: Option<&str>) -> Option<String> {
        search
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| format!("%{value}%"))
    }

    fn user_filter(query: &UserQuery) -> (String, Vec<SqlValue>) {
        let mut clauses: Vec<&str> = Vec::new();
        let mut params_list: Vec<SqlValue> = Vec::new();
        if let Some(tenant) = query
            .tenant_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            clauses.push("tenant_id = ?");
            params_list.push(SqlValue::from(tenant.to_string()));
        }
        if let Some(pattern) = Self::like_pattern(query.search.as_deref()) {
            clauses.push("(display_name LIKE ? OR upn LIKE ? OR email LIKE ? OR oid LIKE ?)");
            for _ in 0..4 {
                params_list.push(SqlValue::from(pattern.clone()));
            }
        }
        if clauses.is_empty() {
            (String::new(), params_list)
        } else {
            (format!(" WHERE {}", clauses.join(" AND ")), params_list)
        }
    }

    fn insert_message_row(conn: &Connection, message: &ChatMessageRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO chat_messages ({CHAT_MESSAGE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"
        );
        conn.execute(
            &sql,
            params![
                message.id,
                message.session_id,
                message.user_id,
                message.role,
                message.content,
                Self::json_to_string(&message.metadata),
                message.created_at
            ],
        )?;
        conn.execute(
            "UPDATE chat_sessions SET updated_at = ? WHERE id = ?",
            params![message.created_at, message.session_id],
        )?;
        Ok(())
    }

    fn map_audit(row: &Row<'_>) -> rusqlite::Result<AuditLogRecord> {
        Ok(AuditLogRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            tenant_id: row.get(2)?,
            action: row.get(3)?,
            resource: row.get(4)?,
            resource_id: row.get(5)?,
            details: Self::json_from_str(row.get::<_, Option<String>>(6)?),
            ip_address: row.get(7)?,
            user_agent: row.get(8)?,
            created_at: row.get(9)?,
        })
    }
}

impl StorageBackend for SqliteStorage {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tenants (
              tenant_id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              is_active INTEGER NOT NULL DEFAULT 1,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS users (
              id TEXT PRIMARY KEY,
              tenant_id TEXT NOT NULL,
              oid TEXT NOT NULL,
              issuer TEXT NOT NULL,
              display_name TEXT,
              upn TEXT,
              email TEXT,
              roles TEXT,
              group_ids TEXT,
              organization_id TEXT,
              domain_id TEXT,
              environment_id TEXT,
              is_active INTEGER NOT NULL DEFAULT 1,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL,
              last_login_at REAL,
              UNIQUE(tenant_id, oid)
            );
            CREATE INDEX IF NOT EXISTS idx_users_oid ON users (oid);
            CREATE TABLE IF NOT EXISTS organizations (
              id TEXT PRIMARY KEY,
              code TEXT NOT NULL UNIQUE,
              name TEXT NOT NULL,
              description TEXT,
              is_active INTEGER NOT NULL DEFAULT 1,
              created_by TEXT,
              created_at REAL NOT NULL,
              updated_by TEXT,
              updated_at REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS domains (
              id TEXT PRIMARY KEY,
              code TEXT NOT NULL UNIQUE,
              name TEXT NOT NULL,
              description TEXT,
              is_active INTEGER NOT NULL DEFAULT 1,
              created_by TEXT,
              created_at REAL NOT NULL,
              updated_by TEXT,
              updated_at REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS environments (
              id TEXT PRIMARY KEY,
              code TEXT NOT NULL UNIQUE,
              name TEXT NOT NULL,
              description TEXT,
              is_active INTEGER NOT NULL DEFAULT 1,
              created_by TEXT,
              created_at REAL NOT NULL,
              updated_by TEXT,
              updated_at REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS audiences (
              id TEXT PRIMARY KEY,
              code TEXT NOT NULL UNIQUE,
              name TEXT NOT NULL,
              description TEXT,
              is_active INTEGER NOT NULL DEFAULT 1,
              created_by TEXT,
              created_at REAL NOT NULL,
              updated_by TEXT,
              updated_at REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS settings (
              id TEXT PRIMARY KEY,
              setting_key TEXT NOT NULL,
              payload TEXT NOT NULL,
              description TEXT,
              is_secret INTEGER NOT NULL DEFAULT 0,
              organization_id TEXT,
              domain_id TEXT,
              environment_id TEXT,
              audience_id TEXT,
              specificity INTEGER NOT NULL DEFAULT 0,
              scope_key TEXT NOT NULL,
              version INTEGER NOT NULL DEFAULT 1,
              is_active INTEGER NOT NULL DEFAULT 1,
              created_by TEXT,
              created_at REAL NOT NULL,
              updated_by TEXT,
              updated_at REAL NOT NULL,
              UNIQUE(setting_key, scope_key)
            );
            CREATE INDEX IF NOT EXISTS idx_settings_key ON settings (setting_key, is_active);
            CREATE TABLE IF NOT EXISTS chat_sessions (
              id TEXT PRIMARY KEY,
              user_id TEXT NOT NULL,
              title TEXT,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chat_sessions_user ON chat_sessions (user_id, updated_at);
            CREATE TABLE IF NOT EXISTS chat_messages (
              id TEXT PRIMARY KEY,
              session_id TEXT NOT NULL,
              user_id TEXT,
              role TEXT NOT NULL,
              content TEXT NOT NULL,
              metadata TEXT,
              created_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chat_messages_session ON chat_messages (session_id, created_at);
            CREATE TABLE IF NOT EXISTS audit_logs (
              id TEXT PRIMARY KEY,
              user_id TEXT,
              tenant_id TEXT,
              action TEXT NOT NULL,
              resource TEXT NOT NULL,
              resource_id TEXT,
              details TEXT,
              ip_address TEXT,
              user_agent TEXT,
              created_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_logs_created ON audit_logs (created_at);
            "#,
        )?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn get_tenant(&self, tenant_id: &str) -> Result<Option<TenantRecord>> {
        self.ensure_initialized()?;
        let cleaned = tenant_id.trim();
        if cleaned.is_empty() {
            return Ok(None);
        }
        let conn = self.open()?;
        let sql = format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE tenant_id = ?");
        let row = conn
            .query_row(&sql, params![cleaned], Self::map_tenant)
            .optional()?;
        Ok(row)
    }

    fn insert_tenant(&self, record: &TenantRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT OR IGNORE INTO tenants (tenant_id, name, is_active, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
            params![
                record.tenant_id,
                record.name,
                Self::flag(record.is_active),
                record.created_at,
                record.updated_at
            ],
        )?;
        Ok(())
    }

    fn list_tenants(&self, query: &TenantQuery) -> Result<Vec<TenantRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut sql = format!("SELECT {TENANT_COLUMNS} FROM tenants");
        let mut params_list: Vec<SqlValue> = Vec::new();
        if let Some(pattern) = Self::like_pattern(query.search.as_deref()) {
            sql.push_str(" WHERE tenant_id LIKE ? OR name LIKE ?");
            params_list.push(SqlValue::from(pattern.clone()));
            params_list.push(SqlValue::from(pattern));
        }
        sql.push_str(" ORDER BY created_at DESC, tenant_id ASC");
        if query.limit > 0 {
            sql.push_str(" LIMIT ? OFFSET ?");
            params_list.push(SqlValue::from(query.limit));
            params_list.push(SqlValue::from(query.offset.max(0)));
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params_list.iter()), Self::map_tenant)?
            .collect::<std::result::Result<Vec<TenantRecord>, _>>()?;
        Ok(rows)
    }

    fn count_tenants(&self, search: Option<&str>) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let total = match Self::like_pattern(search) {
            Some(pattern) => conn.query_row(
                "SELECT COUNT(*) FROM tenants WHERE tenant_id LIKE ? OR name LIKE ?",
                params![pattern, pattern],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM tenants", [], |row| row.get(0))?,
        };
        Ok(total)
    }

    fn delete_tenant(&self, tenant_id: &str) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM tenants WHERE tenant_id = ?",
            params![tenant_id.trim()],
        )?;
        Ok(affected as i64)
    }

    fn get_user(&self, tenant_id: &str, oid: &str) -> Result<Option<UserRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE tenant_id = ? AND oid = ?");
        let row = conn
            .query_row(&sql, params![tenant_id.trim(), oid.trim()], Self::map_user)
            .optional()?;
        Ok(row)
    }

    fn find_user_by_oid(&self, oid: &str) -> Result<Option<UserRecord>> {
        self.ensure_initialized()?;
        let cleaned = oid.trim();
        if cleaned.is_empty() {
            return Ok(None);
        }
        let conn = self.open()?;
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE oid = ? ORDER BY last_login_at DESC LIMIT 1"
        );
        let row = conn
            .query_row(&sql, params![cleaned], Self::map_user)
            .optional()?;
        Ok(row)
    }

    fn get_user_by_id(&self, id: &str) -> Result<Option<UserRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?");
        let row = conn
            .query_row(&sql, params![id.trim()], Self::map_user)
            .optional()?;
        Ok(row)
    }

    fn list_users(&self, query: &UserQuery) -> Result<Vec<UserRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let (filter, mut params_list) = Self::user_filter(query);
        let mut sql = format!("SELECT {USER_COLUMNS} FROM users{filter} ORDER BY created_at DESC, id ASC");
        if query.limit > 0 {
            sql.push_str(" LIMIT ? OFFSET ?");
            params_list.push(SqlValue::from(query.limit));
            params_list.push(SqlValue::from(query.offset.max(0)));
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params_list.iter()), Self::map_user)?
            .collect::<std::result::Result<Vec<UserRecord>, _>>()?;
        Ok(rows)
    }

    fn count_users(&self, query: &UserQuery) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let (filter, params_list) = Self::user_filter(query);
        let sql = format!("SELECT COUNT(*) FROM users{filter}");
        let total = conn.query_row(&sql, params_from_iter(params_list.iter()), |row| row.get(0))?;
        Ok(total)
    }

    fn upsert_user(&self, record: &UserRecord) -> Result<UserRecord> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO users (id, tenant_id, oid, issuer, display_name, upn, email, roles, group_ids, \
             organization_id, domain_id, environment_id, is_active, created_at, updated_at, last_login_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(tenant_id, oid) DO UPDATE SET issuer = excluded.issuer, display_name = excluded.display_name, \
             upn = excluded.upn, email = excluded.email, roles = excluded.roles, group_ids = excluded.group_ids, \
             organization_id = excluded.organization_id, domain_id = excluded.domain_id, \
             environment_id = excluded.environment_id, is_active = excluded.is_active, \
             updated_at = excluded.updated_at, last_login_at = excluded.last_login_at",
            params![
                record.id,
                record.tenant_id,
                record.oid,
                record.issuer,
                record.display_name,
                record.upn,
                record.email,
                Self::string_list_to_json(&record.roles),
                Self::string_list_to_json(&record.groups),
                record.organization_id,
                record.domain_id,
                record.environment_id,
                Self::flag(record.is_active),
                record.created_at,
                record.updated_at,
                record.last_login_at
            ],
        )?;
        // 并发首登时另一方可能先插入，主键以库中行为准。
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE tenant_id = ? AND oid = ?");
        let stored = conn.query_row(&sql, params![record.tenant_id, record.oid], Self::map_user)?;
        Ok(stored)
    }

    fn delete_user(&self, id: &str) -> Result<i64> {
        self.ensure_initialized()?;
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let cleaned = id.trim();
        tx.execute(
            "DELETE FROM chat_messages WHERE session_id IN (SELECT id FROM chat_sessions WHERE user_id = ?)",
            params![cleaned],
        )?;
        tx.execute("DELETE FROM chat_sessions WHERE user_id = ?", params![cleaned])?;
        let affected = tx.execute("DELETE FROM users WHERE id = ?", params![cleaned])?;
        tx.commit()?;
        Ok(affected as i64)
    }

    fn list_master(&self, kind: MasterKind, active_only: bool) -> Result<Vec<MasterRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut sql = format!("SELECT {MASTER_COLUMNS} FROM {}", kind.table());
        if active_only {
            sql.push_str(" WHERE is_active = 1");
        }
        sql.push_str(" ORDER BY code ASC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], Self::map_master)?
            .collect::<std::result::Result<Vec<MasterRecord>, _>>()?;
        Ok(rows)
    }

    fn get_master(&self, kind: MasterKind, id: &str) -> Result<Option<MasterRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let sql = format!("SELECT {MASTER_COLUMNS} FROM {} WHERE id = ?", kind.table());
        let row = conn
            .query_row(&sql, params![id.trim()], Self::map_master)
            .optional()?;
        Ok(row)
    }

    fn get_master_by_code(&self, kind: MasterKind, code: &str) -> Result<Option<MasterRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let sql = format!("SELECT {MASTER_COLUMNS} FROM {} WHERE code = ?", kind.table());
        let row = conn
            .query_row(&sql, params![code.trim()], Self::map_master)
            .optional()?;
        Ok(row)
    }

    fn insert_master(&self, kind: MasterKind, record: &MasterRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let sql = format!(
            "INSERT INTO {} ({MASTER_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            kind.table()
        );
        conn.execute(
            &sql,
            params![
                record.id,
                record.code,
                record.name,
                record.description,
                Self::flag(record.is_active),
                record.created_by,
                record.created_at,
                record.updated_by,
                record.updated_at
            ],
        )?;
        Ok(())
    }

    fn update_master(&self, kind: MasterKind, record: &MasterRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let sql = format!(
            "UPDATE {} SET code = ?, name = ?, description = ?, is_active = ?, updated_by = ?, updated_at = ? WHERE id = ?",
            kind.table()
        );
        conn.execute(
            &sql,
            params![
                record.code,
                record.name,
                record.description,
                Self::flag(record.is_active),
                record.updated_by,
                record.updated_at,
                record.id
            ],
        )?;
        Ok(())
    }

    fn delete_master(&self, kind: MasterKind, id: &str) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let sql = format!("DELETE FROM {} WHERE id = ?", kind.table());
        let affected = conn.execute(&sql, params![id.trim()])?;
        Ok(affected as i64)
    }

    fn list_settings(&self, key: Option<&str>) -> Result<Vec<(SettingRecord, ScopeNames)>> {
        self.ensure_initialized()?;
        let mut params_list: Vec<SqlValue> = Vec::new();
        let mut sql = format!(
            "SELECT {SETTING_COLUMNS}, o.name, d.name, e.name, a.name FROM settings s \
             LEFT JOIN organizations o ON o.id = s.organization_id \
             LEFT JOIN domains d ON d.id = s.domain_id \
             LEFT JOIN environments e ON e.id = s.environment_id \
             LEFT JOIN audiences a ON a.id = s.audience_id"
        );
        if let Some(key) = key.map(str::trim).filter(|value| !value.is_empty()) {
            sql.push_str(" WHERE s.setting_key = ?");
            params_list.push(SqlValue::from(key.to_string()));
        }
        sql.push_str(" ORDER BY s.specificity DESC, s.setting_key ASC");
        let conn = self.open()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params_list.iter()), |row| {
                let setting = Self::map_setting(row)?;
                let names = ScopeNames {
                    organization_name: row.get(17)?,
                    domain_name: row.get(18)?,
                    environment_name: row.get(19)?,
                    audience_name: row.get(20)?,
                };
                Ok((setting, names))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn get_setting(&self, id: &str) -> Result<Option<SettingRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let sql = format!("SELECT {SETTING_COLUMNS} FROM settings s WHERE s.id = ?");
        let row = conn
            .query_row(&sql, params![id.trim()], Self::map_setting)
            .optional()?;
        Ok(row)
    }

    fn get_setting_by_scope(&self, key: &str, scope_key: &str) -> Result<Option<SettingRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let sql = format!(
            "SELECT {SETTING_COLUMNS} FROM settings s WHERE s.setting_key = ? AND s.scope_key = ?"
        );
        let row = conn
            .query_row(&sql, params![key, scope_key], Self::map_setting)
            .optional()?;
        Ok(row)
    }

    fn insert_setting(&self, record: &SettingRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO settings (id, setting_key, payload, description, is_secret, organization_id, domain_id, \
             environment_id, audience_id, specificity, scope_key, version, is_active, created_by, created_at, \
             updated_by, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.id,
                record.key,
                Self::json_to_string(&record.payload),
                record.description,
                Self::flag(record.is_secret),
                record.organization_id,
                record.domain_id,
                record.environment_id,
                record.audience_id,
                record.specificity,
                record.scope_key,
                record.version,
                Self::flag(record.is_active),
                record.created_by,
                record.created_at,
                record.updated_by,
                record.updated_at
            ],
        )?;
        Ok(())
    }

    fn update_setting(&self, record: &SettingRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE settings SET setting_key = ?, payload = ?, description = ?, is_secret = ?, organization_id = ?, domain_id = ?, \
             environment_id = ?, audience_id = ?, specificity = ?, scope_key = ?, version = ?, is_active = ?, \
             updated_by = ?, updated_at = ? WHERE id = ?",
            params![
                record.key,
                Self::json_to_string(&record.payload),
                record.description,
                Self::flag(record.is_secret),
                record.organization_id,
                record.domain_id,
                record.environment_id,
                record.audience_id,
                record.specificity,
                record.scope_key,
                record.version,
                Self::flag(record.is_active),
                record.updated_by,
                record.updated_at,
                record.id
            ],
        )?;
        Ok(())
    }

    fn delete_setting(&self, id: &str) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute("DELETE FROM settings WHERE id = ?", params![id.trim()])?;
        Ok(affected as i64)
    }

    fn query_setting_candidates(
        &self,
        query: &SettingCandidateQuery,
    ) -> Result<Vec<SettingRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        // 维度为空的行对任意调用方生效；调用方维度为空时只命中该维度为空的行。
        let sql = format!(
            "SELECT {SETTING_COLUMNS} FROM settings s WHERE s.setting_key = ? AND s.is_active = 1 AND s.is_secret = 0 \
             AND (s.organization_id IS NULL OR s.organization_id = ?) \
             AND (s.domain_id IS NULL OR s.domain_id = ?) \
             AND (s.environment_id IS NULL OR s.environment_id = ?) \
             AND (s.audience_id IS NULL OR s.audience_id = ?)"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![
                    query.key,
                    query.organization_id,
                    query.domain_id,
                    query.environment_id,
                    query.audience_id
                ],
                Self::map_setting,
            )?
            .collect::<std::result::Result<Vec<SettingRecord>, _>>()?;
        Ok(rows)
    }

    fn insert_chat_session(&self, record: &ChatSessionRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let sql = format!("INSERT INTO chat_sessions ({CHAT_SESSION_COLUMNS}) VALUES (?, ?, ?, ?, ?)");
        conn.execute(
            &sql,
            params![
                record.id,
                record.user_id,
                record.title,
                record.created_at,
                record.updated_at
            ],
        )?;
        Ok(())
    }

    fn get_chat_session(&self, id: &str, user_id: &str) -> Result<Option<ChatSessionRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let sql = format!("SELECT {CHAT_SESSION_COLUMNS} FROM chat_sessions WHERE id = ? AND user_id = ?");
        let row = conn
            .query_row(&sql, params![id.trim(), user_id], Self::map_chat_session)
            .optional()?;
        Ok(row)
    }

    fn list_chat_sessions(&self, user_id: &str) -> Result<Vec<ChatSessionRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let sql = format!(
            "SELECT {CHAT_SESSION_COLUMNS} FROM chat_sessions WHERE user_id = ? ORDER BY updated_at DESC, rowid DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![user_id], Self::map_chat_session)?
            .collect::<std::result::Result<Vec<ChatSessionRecord>, _>>()?;
        Ok(rows)
    }

    fn update_chat_session(&self, record: &ChatSessionRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE chat_sessions SET title = ?, updated_at = ? WHERE id = ?",
            params![record.title, record.updated_at, record.id],
        )?;
        Ok(())
    }

    fn delete_chat_session(&self, id: &str) -> Result<i64> {
        self.ensure_initialized()?;
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = tx.execute("DELETE FROM chat_messages WHERE session_id = ?", params![id])?;
        tx.execute("DELETE FROM chat_sessions WHERE id = ?", params![id])?;
        tx.commit()?;
        Ok(removed as i64)
    }

    fn list_chat_messages(
        &self,
        session_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<ChatMessageRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut sql = format!(
            "SELECT {CHAT_MESSAGE_COLUMNS} FROM chat_messages WHERE session_id = ? ORDER BY created_at ASC, rowid ASC"
        );
        let mut params_list: Vec<SqlValue> = vec![SqlValue::from(session_id.to_string())];
        if let Some(limit) = limit.filter(|value| *value > 0) {
            sql.push_str(" LIMIT ?");
            params_list.push(SqlValue::from(limit));
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params_list.iter()), Self::map_chat_message)?
            .collect::<std::result::Result<Vec<ChatMessageRecord>, _>>()?;
        Ok(rows)
    }

    fn get_chat_message(&self, session_id: &str, id: &str) -> Result<Option<ChatMessageRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let sql = format!(
            "SELECT {CHAT_MESSAGE_COLUMNS} FROM chat_messages WHERE session_id = ? AND id = ?"
        );
        let row = conn
            .query_row(&sql, params![session_id, id.trim()], Self::map_chat_message)
            .optional()?;
        Ok(row)
    }

    fn insert_chat_message(&self, message: &ChatMessageRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        Self::insert_message_row(&conn, message)
    }

    fn replace_chat_messages_from(
        &self,
        from_id: &str,
        message: &ChatMessageRecord,
    ) -> Result<bool> {
        self.ensure_initialized()?;
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let anchor: Option<(f64, i64)> = tx
            .query_row(
                "SELECT created_at, rowid FROM chat_messages WHERE session_id = ? AND id = ?",
                params![message.session_id, from_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((created_at, rowid)) = anchor else {
            return Ok(false);
        };
        // 与列表排序一致：时间相同按写入顺序截断。
        tx.execute(
            "DELETE FROM chat_messages WHERE session_id = ? AND (created_at > ? OR (created_at = ? AND rowid >= ?))",
            params![message.session_id, created_at, created_at, rowid],
        )?;
        Self::insert_message_row(&tx, message)?;
        tx.commit()?;
        Ok(true)
    }

    fn append_audit_log(&self, record: &AuditLogRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let sql = format!("INSERT INTO audit_logs ({AUDIT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)");
        conn.execute(
            &sql,
            params![
                record.id,
                record.user_id,
                record.tenant_id,
                record.action,
                record.resource,
                record.resource_id,
                Self::json_to_string(&record.details),
                record.ip_address,
                record.user_agent,
                record.created_at
            ],
        )?;
        Ok(())
    }

    fn list_audit_logs(&self, offset: i64, limit: i64) -> Result<(Vec<AuditLogRecord>, i64)> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM audit_logs", [], |row| row.get(0))?;
        let mut params_list: Vec<SqlValue> = Vec::new();
        let mut sql = format!("SELECT {AUDIT_COLUMNS} FROM audit_logs ORDER BY created_at DESC, rowid DESC");
        if limit > 0 {
            sql.push_str(" LIMIT ? OFFSET ?");
            params_list.push(SqlValue::from(limit));
            params_list.push(SqlValue::from(offset.max(0)));
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params_list.iter()), Self::map_audit)?
            .collect::<std::result::Result<Vec<AuditLogRecord>, _>>()?;
        Ok((rows, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_storage() -> SqliteStorage {
        let db_path = std::env::temp_dir().join(format!(
            "adminhub_sqlite_{}.db",
            uuid::Uuid::new_v4().simple()
        ));
        SqliteStorage::new(db_path.to_string_lossy().to_string())
    }

    fn setting(id: &str, org: Option<&str>, secret: bool) -> SettingRecord {
        SettingRecord {
            id: id.to_string(),
            key: "theme".to_string(),
            payload: json!({ "id": id }),
            description: None,
            is_secret: secret,
            organization_id: org.map(str::to_string),
            domain_id: None,
            environment_id: None,
            audience_id: None,
            specificity: if org.is_some() { 2 } else { 0 },
            scope_key: format!("{}|-|-|-", org.unwrap_or("-")),
            version: 1,
            is_active: true,
            created_by: None,
            created_at: 1.0,
            updated_by: None,
            updated_at: 1.0,
        }
    }

    #[test]
    fn candidate_query_applies_null_or_equal_predicates() {
        let storage = temp_storage();
        storage.insert_setting(&setting("global", None, false)).unwrap();
        storage.insert_setting(&setting("org-a", Some("a"), false)).unwrap();
        storage.insert_setting(&setting("org-b", Some("b"), false)).unwrap();

        let query = SettingCandidateQuery {
            key: "theme".to_string(),
            organization_id: Some("a".to_string()),
            ..Default::default()
        };
        let mut ids = storage
            .query_setting_candidates(&query)
            .unwrap()
            .into_iter()
            .map(|row| row.id)
            .collect::<Vec<_>>();
        ids.sort();
        assert_eq!(ids, vec!["global", "org-a"]);

        let anonymous = SettingCandidateQuery {
            key: "theme".to_string(),
            ..Default::default()
        };
        let rows = storage.query_setting_candidates(&anonymous).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].payload, json!({ "id": "global" }));
    }

    #[test]
    fn candidate_query_drops_secret_rows() {
        let storage = temp_storage();
        storage.insert_setting(&setting("secret", Some("a"), true)).unwrap();
        let query = SettingCandidateQuery {
            key: "theme".to_string(),
            organization_id: Some("a".to_string()),
            ..Default::default()
        };
        assert!(storage.query_setting_candidates(&query).unwrap().is_empty());
    }

    #[test]
    fn duplicate_scope_is_rejected_by_store() {
        let storage = temp_storage();
        storage.insert_setting(&setting("one", Some("a"), false)).unwrap();
        assert!(storage.insert_setting(&setting("two", Some("a"), false)).is_err());
    }

    #[test]
    fn duplicate_scope_error_is_reported_as_unique_violation() {
        let storage = temp_storage();
        storage.insert_setting(&setting("one", Some("a"), false)).unwrap();
        let err = storage
            .insert_setting(&setting("two", Some("a"), false))
            .unwrap_err();
        assert!(is_unique_violation(&err));
        assert!(!is_unique_violation(&anyhow::anyhow!("other failure")));
    }

    #[test]
    fn update_setting_persists_renamed_key() {
        let storage = temp_storage();
        let mut record = setting("one", None, false);
        storage.insert_setting(&record).unwrap();
        record.key = "palette".to_string();
        record.version = 2;
        storage.update_setting(&record).unwrap();

        let stored = storage.get_setting("one").unwrap().unwrap();
        assert_eq!(stored.key, "palette");
        assert_eq!(stored.version, 2);
        assert!(storage.get_setting_by_scope("theme", "-|-|-|-").unwrap().is_none());
        assert!(storage.get_setting_by_scope("palette", "-|-|-|-").unwrap().is_some());
    }

    fn user(id: &str, oid: &str) -> UserRecord {
        UserRecord {
            id: id.to_string(),
            tenant_id: "t1".to_string(),
            oid: oid.to_string(),
            issuer: "header".to_string(),
            display_name: Some(format!("name-{id}")),
            upn: None,
            email: None,
            roles: Vec::new(),
            groups: Vec::new(),
            organization_id: None,
            domain_id: None,
            environment_id: None,
            is_active: true,
            created_at: 1.0,
            updated_at: 1.0,
            last_login_at: Some(1.0),
        }
    }

    #[test]
    fn upsert_user_keeps_first_row_for_same_principal() {
        let storage = temp_storage();
        let first = storage.upsert_user(&user("u-1", "oid-1")).unwrap();
        let second = storage.upsert_user(&user("u-2", "oid-1")).unwrap();
        assert_eq!(first.id, "u-1");
        assert_eq!(second.id, "u-1");
        assert_eq!(second.display_name.as_deref(), Some("name-u-2"));
        assert_eq!(storage.count_users(&UserQuery::default()).unwrap(), 1);
    }

    fn message(id: &str, session_id: &str, created_at: f64) -> ChatMessageRecord {
        ChatMessageRecord {
            id: id.to_string(),
            session_id: session_id.to_string(),
            user_id: Some("u-1".to_string()),
            role: "user".to_string(),
            content: id.to_string(),
            metadata: Value::Null,
            created_at,
        }
    }

    #[test]
    fn replace_messages_truncates_from_anchor() {
        let storage = temp_storage();
        storage
            .insert_chat_session(&ChatSessionRecord {
                id: "s1".to_string(),
                user_id: "u-1".to_string(),
                title: None,
                created_at: 1.0,
                updated_at: 1.0,
            })
            .unwrap();
        for (index, id) in ["m1", "m2", "m3"].iter().enumerate() {
            storage
                .insert_chat_message(&message(id, "s1", 2.0 + index as f64))
                .unwrap();
        }
        assert!(storage
            .replace_chat_messages_from("m2", &message("m4", "s1", 9.0))
            .unwrap());
        assert!(!storage
            .replace_chat_messages_from("missing", &message("m5", "s1", 10.0))
            .unwrap());

        let ids = storage
            .list_chat_messages("s1", None)
            .unwrap()
            .into_iter()
            .map(|row| row.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["m1", "m4"]);
        let session = storage.get_chat_session("s1", "u-1").unwrap().unwrap();
        assert_eq!(session.updated_at, 9.0);
    }

    #[test]
    fn delete_user_removes_chat_history() {
        let storage = temp_storage();
        let stored = storage.upsert_user(&user("u-1", "oid-1")).unwrap();
        storage
            .insert_chat_session(&ChatSessionRecord {
                id: "s1".to_string(),
                user_id: stored.id.clone(),
                title: None,
                created_at: 1.0,
                updated_at: 1.0,
            })
            .unwrap();
        storage.insert_chat_message(&message("m1", "s1", 2.0)).unwrap();

        assert_eq!(storage.delete_user(&stored.id).unwrap(), 1);
        assert!(storage.list_chat_sessions(&stored.id).unwrap().is_empty());
        assert!(storage.list_chat_messages("s1", None).unwrap().is_empty());
    }

    #[test]
    fn audit_logs_are_newest_first() {
        let storage = temp_storage();
        for (index, action) in ["create", "update"].iter().enumerate() {
            storage
                .append_audit_log(&AuditLogRecord {
                    id: format!("log-{index}"),
                    user_id: Some("u1".to_string()),
                    tenant_id: None,
                    action: action.to_string(),
                    resource: "settings".to_string(),
                    resource_id: None,
                    details: json!({}),
                    ip_address: None,
                    user_agent: None,
                    created_at: index as f64,
                })
                .unwrap();
        }
        let (rows, total) = storage.list_audit_logs(0, 10).unwrap();
        assert_eq!(total, 2);
        assert_eq!(rows[0].action, "update");
    }
}
