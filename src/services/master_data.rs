// 主数据：组织、域、环境、受众四类维度表的增删改查，写操作记审计日志。
use crate::services::audit::{now_ts, AuditContext, AuditLogger};
use crate::services::error::{ServiceError, ServiceResult};
use crate::services::run_storage;
use crate::storage::{is_unique_violation, MasterKind, MasterRecord, StorageBackend};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct MasterCreate {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

/// 局部更新，未提供的字段保持不变。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MasterUpdate {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

/// 用户维度下拉选项，仅含启用的行。
#[derive(Debug, Clone, Serialize)]
pub struct MasterOption {
    pub id: String,
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MasterDataOptions {
    pub organizations: Vec<MasterOption>,
    pub domains: Vec<MasterOption>,
    pub environments: Vec<MasterOption>,
}

fn default_active() -> bool {
    true
}

fn audit_resource(kind: MasterKind) -> String {
    kind.label().to_lowercase()
}

pub struct MasterDataService {
    storage: Arc<dyn StorageBackend>,
    audit: Arc<AuditLogger>,
}

impl MasterDataService {
    pub fn new(storage: Arc<dyn StorageBackend>, audit: Arc<AuditLogger>) -> Self {
        Self { storage, audit }
    }

    pub async fn list(&self, kind: MasterKind, active_only: bool) -> ServiceResult<Vec<MasterRecord>> {
        let rows = run_storage(&self.storage, move |storage| storage.list_master(kind, active_only)).await?;
        Ok(rows)
    }

    pub async fn options(&self) -> ServiceResult<MasterDataOptions> {
        let (organizations, domains, environments) = run_storage(&self.storage, |storage| {
            let collect = |kind: MasterKind| -> anyhow::Result<Vec<MasterOption>> {
                let mut rows = storage.list_master(kind, true)?;
                rows.sort_by(|left, right| left.name.cmp(&right.name));
                Ok(rows
                    .into_iter()
                    .map(|row| MasterOption {
                        id: row.id,
                        name: row.name,
                        code: row.code,
                    })
                    .collect())
            };
            Ok((
                collect(MasterKind::Organization)?,
                collect(MasterKind::Domain)?,
                collect(MasterKind::Environment)?,
            ))
        })
        .await?;
        Ok(MasterDataOptions {
            organizations,
            domains,
            environments,
        })
    }

    pub async fn get(&self, kind: MasterKind, id: &str) -> ServiceResult<MasterRecord> {
        let id = id.to_string();
        run_storage(&self.storage, move |storage| storage.get_master(kind, &id))
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("{} not found", kind.label())))
    }

    pub async fn create(
        &self,
        kind: MasterKind,
        input: MasterCreate,
        context: &AuditContext,
    ) -> ServiceResult<MasterRecord> {
        let code = input.code.trim().to_string();
        let name = input.name.trim().to_string();
        if code.is_empty() || name.is_empty() {
            return Err(ServiceError::invalid_request("code and name are required"));
        }
        let now = now_ts();
        let record = MasterRecord {
            id: uuid::Uuid::new_v4().to_string(),
            code,
            name,
            description: input.description,
            is_active: input.is_active,
            created_by: context.actor(),
            created_at: now,
            updated_by: context.actor(),
            updated_at: now,
        };
        let stored = record.clone();
        let inserted = run_storage(&self.storage, move |storage| {
            if storage.get_master_by_code(kind, &stored.code)?.is_some() {
                return Ok(false);
            }
            // 并发创建同一编码时由唯一约束兜底。
            match storage.insert_master(kind, &stored) {
                Ok(()) => Ok(true),
                Err(err) if is_unique_violation(&err) => Ok(false),
                Err(err) => Err(err),
            }
        })
        .await?;
        if !inserted {
            return Err(ServiceError::invalid_request(format!(
                "{} code already exists",
                kind.label()
            )));
        }
        self.audit
            .record(
                context,
                "create",
                &audit_resource(kind),
                Some(&record.id),
                json!({ "message": format!("Created {}: {}", audit_resource(kind), record.name) }),
            )
            .await;
        Ok(record)
    }

    pub async fn update(
        &self,
        kind: MasterKind,
        id: &str,
        patch: MasterUpdate,
        context: &AuditContext,
    ) -> ServiceResult<MasterRecord> {
        let mut record = self.get(kind, id).await?;
        if let Some(code) = patch.code.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
            if code != record.code {
                let lookup = code.to_string();
                let clash = run_storage(&self.storage, move |storage| {
                    storage.get_master_by_code(kind, &lookup)
                })
                .await?;
                if clash.is_some_and(|other| other.id != record.id) {
                    return Err(ServiceError::invalid_request(format!(
                        "{} code already exists",
                        kind.label()
                    )));
                }
                record.code = code.to_string();
            }
        }
        if let Some(name) = patch.name.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
            record.name = name.to_string();
        }
        if patch.description.is_some() {
            record.description = patch.description;
        }
        if let Some(active) = patch.is_active {
            record.is_active = active;
        }
        record.updated_by = context.actor();
        record.updated_at = now_ts();
        let stored = record.clone();
        let updated = run_storage(&self.storage, move |storage| {
            match storage.update_master(kind, &stored) {
                Ok(()) => Ok(true),
                Err(err) if is_unique_violation(&err) => Ok(false),
                Err(err) => Err(err),
            }
        })
        .await?;
        if !updated {
            return Err(ServiceError::invalid_request(format!(
                "{} code already exists",
                kind.label()
            )));
        }
        self.audit
            .record(
                context,
                "update",
                &audit_resource(kind),
                Some(&record.id),
                json!({ "message": format!("Updated {}: {}", audit_resource(kind), record.name) }),
            )
            .await;
        Ok(record)
    }

    pub async fn delete(&self, kind: MasterKind, id: &str, context: &AuditContext) -> ServiceResult<()> {
        let record = self.get(kind, id).await?;
        let target = record.id.clone();
        run_storage(&self.storage, move |storage| storage.delete_master(kind, &target)).await?;
        self.audit
            .record(
                context,
                "delete",
                &audit_resource(kind),
                Some(&record.id),
                json!({ "message": format!("Deleted {}: {}", audit_resource(kind), record.name) }),
            )
            .await;
        Ok(())
    }
}
