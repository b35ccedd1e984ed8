// 用户管理：按上游身份声明即时建档租户与用户，并维护用户的组织维度归属。
use crate::auth::PrincipalClaims;
use crate::services::audit::now_ts;
use crate::services::error::{ServiceError, ServiceResult};
use crate::services::run_storage;
use crate::storage::{
    MasterKind, StorageBackend, TenantQuery, TenantRecord, UserQuery, UserRecord,
};
use anyhow::Result;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

/// 用户维度归属的更新请求，空值表示清除。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserScopeUpdate {
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub domain_id: Option<String>,
    #[serde(default)]
    pub environment_id: Option<String>,
}

pub struct UserManager {
    storage: Arc<dyn StorageBackend>,
}

impl UserManager {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    pub async fn get_or_create_tenant(&self, tenant_id: &str) -> ServiceResult<TenantRecord> {
        let tenant_id = tenant_id.trim().to_string();
        if tenant_id.is_empty() {
            return Err(ServiceError::invalid_request("tenant_id is required"));
        }
        let tenant = run_storage(&self.storage, move |storage| {
            ensure_tenant(storage, &tenant_id)
        })
        .await?;
        Ok(tenant)
    }

    /// 首次出现时创建用户；已存在时只更新变化的资料字段，并刷新最近登录时间。
    pub async fn get_or_create_user(&self, claims: &PrincipalClaims) -> ServiceResult<UserRecord> {
        if claims.oid.trim().is_empty() || claims.tenant_id.trim().is_empty() {
            return Err(ServiceError::invalid_request("oid and tenant_id are required"));
        }
        let claims = claims.clone();
        let user = run_storage(&self.storage, move |storage| provision_user(storage, &claims)).await?;
        Ok(user)
    }

    pub async fn list_users(&self, query: UserQuery) -> ServiceResult<Vec<UserRecord>> {
        let users = run_storage(&self.storage, move |storage| storage.list_users(&query)).await?;
        Ok(users)
    }

    pub async fn count_users(&self, query: UserQuery) -> ServiceResult<i64> {
        let total = run_storage(&self.storage, move |storage| storage.count_users(&query)).await?;
        Ok(total)
    }

    /// 删除用户及其对话记录，返回被删除的用户。
    pub async fn delete_user(&self, user_id: &str) -> ServiceResult<UserRecord> {
        let user_id = user_id.trim().to_string();
        let removed = run_storage(&self.storage, move |storage| {
            let Some(user) = storage.get_user_by_id(&user_id)? else {
                return Ok(None);
            };
            storage.delete_user(&user.id)?;
            Ok(Some(user))
        })
        .await?;
        let user = removed.ok_or_else(|| ServiceError::not_found("User not found"))?;
        info!("删除用户: tenant={}, oid={}", user.tenant_id, user.oid);
        Ok(user)
    }

    pub async fn list_tenants(&self, query: TenantQuery) -> ServiceResult<Vec<TenantRecord>> {
        let tenants =
            run_storage(&self.storage, move |storage| storage.list_tenants(&query)).await?;
        Ok(tenants)
    }

    pub async fn count_tenants(&self, search: Option<String>) -> ServiceResult<i64> {
        let total = run_storage(&self.storage, move |storage| {
            storage.count_tenants(search.as_deref())
        })
        .await?;
        Ok(total)
    }

    /// 仍有关联用户的租户不可删除。
    pub async fn delete_tenant(&self, tenant_id: &str) -> ServiceResult<()> {
        let tenant_id = tenant_id.trim().to_string();
        let outcome = run_storage(&self.storage, move |storage| {
            if storage.get_tenant(&tenant_id)?.is_none() {
                return Ok(Err(ServiceError::not_found("Tenant not found")));
            }
            let users = storage.count_users(&UserQuery {
                tenant_id: Some(tenant_id.clone()),
                ..Default::default()
            })?;
            if users > 0 {
                return Ok(Err(ServiceError::invalid_request(format!(
                    "Cannot delete tenant. There are {users} user(s) associated with this tenant. Please delete all users first."
                ))));
            }
            storage.delete_tenant(&tenant_id)?;
            info!("删除租户: {tenant_id}");
            Ok(Ok(()))
        })
        .await?;
        outcome
    }

    /// 指定用户的组织、域、环境；引用的主数据必须存在且启用。
    pub async fn assign_scope(&self, user_id: &str, update: UserScopeUpdate) -> ServiceResult<UserRecord> {
        let user_id = user_id.trim().to_string();
        let storage = self.storage.clone();
        let outcome = run_storage(&storage, move |storage| {
            let Some(mut user) = storage.get_user_by_id(&user_id)? else {
                return Ok(Err(ServiceError::not_found("User not found")));
            };
            let checks = [
                (MasterKind::Organization, &update.organization_id),
                (MasterKind::Domain, &update.domain_id),
                (MasterKind::Environment, &update.environment_id),
            ];
            for (kind, value) in checks {
                let Some(id) = normalize_id(value) else {
                    continue;
                };
                let valid = storage
                    .get_master(kind, &id)?
                    .map(|record| record.is_active)
                    .unwrap_or(false);
                if !valid {
                    return Ok(Err(ServiceError::invalid_request(format!(
                        "Invalid or inactive {}",
                        kind.label().to_lowercase()
                    ))));
                }
            }
            user.organization_id = normalize_id(&update.organization_id);
            user.domain_id = normalize_id(&update.domain_id);
            user.environment_id = normalize_id(&update.environment_id);
            user.updated_at = now_ts();
            Ok(Ok(storage.upsert_user(&user)?))
        })
        .await?;
        outcome
    }
}

fn normalize_id(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn ensure_tenant(storage: &dyn StorageBackend, tenant_id: &str) -> Result<TenantRecord> {
    if let Some(existing) = storage.get_tenant(tenant_id)? {
        return Ok(existing);
    }
    let now = now_ts();
    let record = TenantRecord {
        tenant_id: tenant_id.to_string(),
        name: tenant_id.to_string(),
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    // 并发建档时由 INSERT OR IGNORE 兜底，随后重新读取。
    storage.insert_tenant(&record)?;
    info!("新建租户: {tenant_id}");
    Ok(storage.get_tenant(tenant_id)?.unwrap_or(record))
}

fn provision_user(storage: &dyn StorageBackend, claims: &PrincipalClaims) -> Result<UserRecord> {
    let tenant_id = claims.tenant_id.trim();
    let oid = claims.oid.trim();
    ensure_tenant(storage, tenant_id)?;
    let now = now_ts();
    if let Some(mut user) = storage.get_user(tenant_id, oid)? {
        merge_changed(&mut user.display_name, &claims.display_name);
        merge_changed(&mut user.upn, &claims.upn);
        merge_changed(&mut user.email, &claims.email);
        if !claims.roles.is_empty() && user.roles != claims.roles {
            user.roles = claims.roles.clone();
        }
        if !claims.groups.is_empty() && user.groups != claims.groups {
            user.groups = claims.groups.clone();
        }
        user.last_login_at = Some(now);
        user.updated_at = now;
        return storage.upsert_user(&user);
    }
    let user = UserRecord {
        id: uuid::Uuid::new_v4().simple().to_string(),
        tenant_id: tenant_id.to_string(),
        oid: oid.to_string(),
        issuer: claims.issuer.clone(),
        display_name: claims.display_name.clone(),
        upn: claims.upn.clone(),
        email: claims.email.clone(),
        roles: claims.roles.clone(),
        groups: claims.groups.clone(),
        organization_id: None,
        domain_id: None,
        environment_id: None,
        is_active: true,
        created_at: now,
        updated_at: now,
        last_login_at: Some(now),
    };
    // 并发首登只保留一行，返回库中实际的记录。
    let stored = storage.upsert_user(&user)?;
    if stored.id == user.id {
        info!("新建用户: tenant={tenant_id}, oid={oid}");
    }
    Ok(stored)
}

fn merge_changed(target: &mut Option<String>, incoming: &Option<String>) {
    let Some(value) = incoming.as_deref().map(str::trim).filter(|value| !value.is_empty()) else {
        return;
    };
    if target.as_deref() != Some(value) {
        *target = Some(value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MasterRecord, SqliteStorage};

    fn manager() -> (UserManager, Arc<dyn StorageBackend>) {
        let db_path = std::env::temp_dir().join(format!(
            "adminhub_users_{}.db",
            uuid::Uuid::new_v4().simple()
        ));
        let storage: Arc<dyn StorageBackend> =
            Arc::new(SqliteStorage::new(db_path.to_string_lossy().to_string()));
        (UserManager::new(storage.clone()), storage)
    }

    fn claims(name: Option<&str>) -> PrincipalClaims {
        PrincipalClaims {
            oid: "oid-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            issuer: "https://issuer".to_string(),
            display_name: name.map(str::to_string),
            roles: vec!["Admin".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn provisioning_is_idempotent_and_updates_profile() {
        let (manager, storage) = manager();
        let first = manager.get_or_create_user(&claims(Some("Ann"))).await.unwrap();
        let second = manager.get_or_create_user(&claims(Some("Ann B"))).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.display_name.as_deref(), Some("Ann B"));
        let third = manager.get_or_create_user(&claims(None)).await.unwrap();
        assert_eq!(third.display_name.as_deref(), Some("Ann B"));
        assert!(storage.get_tenant("tenant-1").unwrap().is_some());
        let tenant = manager.get_or_create_tenant(" tenant-1 ").await.unwrap();
        assert_eq!(tenant.tenant_id, "tenant-1");
        assert!(manager.get_or_create_tenant("  ").await.is_err());
        assert_eq!(manager.list_users(UserQuery::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_first_login_yields_single_user() {
        for round in 0..20 {
            let (manager, storage) = manager();
            let manager = Arc::new(manager);
            let tasks = (0..8)
                .map(|_| {
                    let manager = manager.clone();
                    tokio::spawn(async move { manager.get_or_create_user(&claims(Some("Ann"))).await })
                })
                .collect::<Vec<_>>();
            let mut ids = Vec::new();
            for task in futures::future::join_all(tasks).await {
                let user = task.unwrap().unwrap_or_else(|err| panic!("round {round}: {err:?}"));
                ids.push(user.id);
            }
            ids.dedup();
            assert_eq!(ids.len(), 1, "round {round}");
            assert_eq!(storage.count_users(&UserQuery::default()).unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn tenant_with_users_cannot_be_deleted() {
        let (manager, _storage) = manager();
        let user = manager.get_or_create_user(&claims(Some("Ann"))).await.unwrap();
        manager.get_or_create_tenant("tenant-2").await.unwrap();
        assert_eq!(manager.count_tenants(None).await.unwrap(), 2);
        assert_eq!(manager.count_tenants(Some("2".to_string())).await.unwrap(), 1);

        let err = manager.delete_tenant("tenant-1").await.unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
        assert!(err.message().contains("1 user(s)"));

        manager.delete_tenant("tenant-2").await.unwrap();
        assert_eq!(
            manager.delete_tenant("tenant-2").await.unwrap_err().code(),
            "NOT_FOUND"
        );

        let removed = manager.delete_user(&user.id).await.unwrap();
        assert_eq!(removed.oid, "oid-1");
        assert_eq!(manager.count_users(UserQuery::default()).await.unwrap(), 0);
        manager.delete_tenant("tenant-1").await.unwrap();
        let tenants = manager.list_tenants(TenantQuery::default()).await.unwrap();
        assert!(tenants.is_empty());
    }

    #[tokio::test]
    async fn assign_scope_requires_active_master_rows() {
        let (manager, storage) = manager();
        let user = manager.get_or_create_user(&claims(None)).await.unwrap();
        storage
            .insert_master(
                MasterKind::Organization,
                &MasterRecord {
                    id: "org-1".to_string(),
                    code: "ACME".to_string(),
                    name: "Acme".to_string(),
                    description: None,
                    is_active: true,
                    created_by: None,
                    created_at: 1.0,
                    updated_by: None,
                    updated_at: 1.0,
                },
            )
            .unwrap();
        let updated = manager
            .assign_scope(
                &user.id,
                UserScopeUpdate {
                    organization_id: Some("org-1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.organization_id.as_deref(), Some("org-1"));

        let err = manager
            .assign_scope(
                &user.id,
                UserScopeUpdate {
                    domain_id: Some("missing".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
        let missing = manager
            .assign_scope("nobody", UserScopeUpdate::default())
            .await
            .unwrap_err();
        assert_eq!(missing.code(), "NOT_FOUND");
    }
}
