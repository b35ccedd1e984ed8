// 配置项：按组织/域/环境/受众四个维度覆盖的配置，解析时取最具体且最新的一条。
use crate::services::audit::{now_ts, AuditContext, AuditLogger};
use crate::services::error::{ServiceError, ServiceResult};
use crate::services::run_storage;
use crate::storage::{
    is_unique_violation, MasterKind, ScopeNames, SettingCandidateQuery, SettingRecord,
    StorageBackend,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

pub const AUDIENCE_WEIGHT: i64 = 10;
pub const DOMAIN_WEIGHT: i64 = 3;
pub const ORGANIZATION_WEIGHT: i64 = 2;
pub const ENVIRONMENT_WEIGHT: i64 = 1;
pub const DEFAULT_AUDIENCE_KEY: &str = "react_admin";
pub const NOT_FOUND_SOURCE: &str = "Default (no setting found)";

/// 四个覆盖维度；空值表示不限定该维度。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingScope {
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub domain_id: Option<String>,
    #[serde(default)]
    pub environment_id: Option<String>,
    #[serde(default)]
    pub audience_id: Option<String>,
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

fn dimension_matches(row: &Option<String>, caller: &Option<String>) -> bool {
    match row {
        None => true,
        Some(value) => caller.as_deref() == Some(value.as_str()),
    }
}

impl SettingScope {
    pub fn of(record: &SettingRecord) -> Self {
        Self {
            organization_id: record.organization_id.clone(),
            domain_id: record.domain_id.clone(),
            environment_id: record.environment_id.clone(),
            audience_id: record.audience_id.clone(),
        }
    }

    pub fn normalized(self) -> Self {
        Self {
            organization_id: clean(self.organization_id),
            domain_id: clean(self.domain_id),
            environment_id: clean(self.environment_id),
            audience_id: clean(self.audience_id),
        }
    }

    /// 受众 > 域 > 组织 > 环境，未设置的维度不计分。
    pub fn specificity(&self) -> i64 {
        let mut score = 0;
        if self.audience_id.is_some() {
            score += AUDIENCE_WEIGHT;
        }
        if self.domain_id.is_some() {
            score += DOMAIN_WEIGHT;
        }
        if self.organization_id.is_some() {
            score += ORGANIZATION_WEIGHT;
        }
        if self.environment_id.is_some() {
            score += ENVIRONMENT_WEIGHT;
        }
        score
    }

    pub fn scope_key(&self) -> String {
        [
            &self.organization_id,
            &self.domain_id,
            &self.environment_id,
            &self.audience_id,
        ]
        .iter()
        .map(|value| value.as_deref().unwrap_or("-"))
        .collect::<Vec<_>>()
        .join("|")
    }

    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if self.organization_id.is_some() {
            parts.push("Organization");
        }
        if self.domain_id.is_some() {
            parts.push("Domain");
        }
        if self.environment_id.is_some() {
            parts.push("Environment");
        }
        if self.audience_id.is_some() {
            parts.push("Audience");
        }
        if parts.is_empty() {
            "Global".to_string()
        } else {
            parts.join("+")
        }
    }

    /// 行的每个维度要么为空，要么等于调用方在该维度的取值。
    pub fn matches(&self, caller: &SettingScope) -> bool {
        dimension_matches(&self.organization_id, &caller.organization_id)
            && dimension_matches(&self.domain_id, &caller.domain_id)
            && dimension_matches(&self.environment_id, &caller.environment_id)
            && dimension_matches(&self.audience_id, &caller.audience_id)
    }

    fn candidate_query(&self, key: &str) -> SettingCandidateQuery {
        SettingCandidateQuery {
            key: key.to_string(),
            organization_id: self.organization_id.clone(),
            domain_id: self.domain_id.clone(),
            environment_id: self.environment_id.clone(),
            audience_id: self.audience_id.clone(),
        }
    }
}

fn rank(a: &SettingRecord, b: &SettingRecord) -> Ordering {
    let sa = SettingScope::of(a).specificity();
    let sb = SettingScope::of(b).specificity();
    sb.cmp(&sa)
        .then_with(|| b.updated_at.total_cmp(&a.updated_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// 从无序候选集中选出最佳行：过滤停用、密文与不匹配的行，按具体度、更新时间、id 排序。
pub fn select_best<'a>(
    candidates: &'a [SettingRecord],
    caller: &SettingScope,
) -> Option<&'a SettingRecord> {
    candidates
        .iter()
        .filter(|row| row.is_active && !row.is_secret)
        .filter(|row| SettingScope::of(row).matches(caller))
        .min_by(|a, b| rank(a, b))
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResolvedSetting {
    pub key: String,
    pub resolved_payload: Option<Value>,
    pub resolved_from: String,
    pub specificity: i64,
    pub found: bool,
}

impl ResolvedSetting {
    fn not_found(key: &str) -> Self {
        Self {
            key: key.to_string(),
            resolved_payload: None,
            resolved_from: NOT_FOUND_SOURCE.to_string(),
            specificity: 0,
            found: false,
        }
    }

    fn from_record(key: &str, record: &SettingRecord) -> Self {
        let scope = SettingScope::of(record);
        Self {
            key: key.to_string(),
            resolved_payload: Some(record.payload.clone()),
            resolved_from: scope.describe(),
            specificity: scope.specificity(),
            found: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolveRequest {
    pub key: String,
    #[serde(default = "default_audience_key")]
    pub audience_key: Option<String>,
    #[serde(default)]
    pub oid: Option<String>,
}

fn default_audience_key() -> Option<String> {
    Some(DEFAULT_AUDIENCE_KEY.to_string())
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettingCreate {
    pub key: String,
    pub payload: Value,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_secret: bool,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(flatten)]
    pub scope: SettingScope,
}

fn default_active() -> bool {
    true
}

/// 局部更新；维度字段区分“未提供”与显式置空。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingUpdate {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_secret: Option<bool>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub organization_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub domain_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub environment_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub audience_id: Option<Option<String>>,
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Serialize)]
pub struct SettingView {
    #[serde(flatten)]
    pub record: SettingRecord,
    #[serde(flatten)]
    pub names: ScopeNames,
}

pub struct SettingsService {
    storage: Arc<dyn StorageBackend>,
    audit: Arc<AuditLogger>,
}

impl SettingsService {
    pub fn new(storage: Arc<dyn StorageBackend>, audit: Arc<AuditLogger>) -> Self {
        Self { storage, audit }
    }

    pub async fn list(&self, key: Option<String>) -> ServiceResult<Vec<SettingView>> {
        let rows = run_storage(&self.storage, move |storage| {
            storage.list_settings(key.as_deref().map(str::trim).filter(|value| !value.is_empty()))
        })
        .await?;
        Ok(rows
            .into_iter()
            .map(|(record, names)| SettingView { record, names })
            .collect())
    }

    pub async fn get(&self, id: &str) -> ServiceResult<SettingRecord> {
        let id = id.to_string();
        run_storage(&self.storage, move |storage| storage.get_setting(&id))
            .await?
            .ok_or_else(|| ServiceError::not_found("Setting not found"))
    }

    pub async fn create(&self, input: SettingCreate, context: &AuditContext) -> ServiceResult<SettingRecord> {
        let key = input.key.trim().to_string();
        if key.is_empty() {
            return Err(ServiceError::invalid_request("key is required"));
        }
        let scope = input.scope.normalized();
        let now = now_ts();
        let record = SettingRecord {
            id: uuid::Uuid::new_v4().to_string(),
            key,
            payload: input.payload,
            description: input.description,
            is_secret: input.is_secret,
            organization_id: scope.organization_id.clone(),
            domain_id: scope.domain_id.clone(),
            environment_id: scope.environment_id.clone(),
            audience_id: scope.audience_id.clone(),
            specificity: scope.specificity(),
            scope_key: scope.scope_key(),
            version: 1,
            is_active: input.is_active,
            created_by: context.actor(),
            created_at: now,
            updated_by: context.actor(),
            updated_at: now,
        };
        let stored = record.clone();
        let inserted = run_storage(&self.storage, move |storage| {
            if storage
                .get_setting_by_scope(&stored.key, &stored.scope_key)?
                .is_some()
            {
                return Ok(false);
            }
            // 检查与写入之间的并发冲突由唯一约束兜底。
            match storage.insert_setting(&stored) {
                Ok(()) => Ok(true),
                Err(err) if is_unique_violation(&err) => Ok(false),
                Err(err) => Err(err),
            }
        })
        .await?;
        if !inserted {
            return Err(ServiceError::invalid_request(
                "Setting key already exists in this scope",
            ));
        }
        self.audit
            .record(
                context,
                "create",
                "settings",
                Some(&record.id),
                json!({ "message": format!("Created setting: {}", record.key) }),
            )
            .await;
        Ok(record)
    }

    /// 更新后重算具体度与维度键，版本号自增。
    pub async fn update(
        &self,
        id: &str,
        patch: SettingUpdate,
        context: &AuditContext,
    ) -> ServiceResult<SettingRecord> {
        let mut record = self.get(id).await?;
        if let Some(key) = patch.key.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
            record.key = key.to_string();
        }
        if let Some(payload) = patch.payload {
            record.payload = payload;
        }
        if patch.description.is_some() {
            record.description = patch.description;
        }
        if let Some(secret) = patch.is_secret {
            record.is_secret = secret;
        }
        if let Some(active) = patch.is_active {
            record.is_active = active;
        }
        let mut scope = SettingScope::of(&record);
        if let Some(value) = patch.organization_id {
            scope.organization_id = value;
        }
        if let Some(value) = patch.domain_id {
            scope.domain_id = value;
        }
        if let Some(value) = patch.environment_id {
            scope.environment_id = value;
        }
        if let Some(value) = patch.audience_id {
            scope.audience_id = value;
        }
        let scope = scope.normalized();
        record.organization_id = scope.organization_id.clone();
        record.domain_id = scope.domain_id.clone();
        record.environment_id = scope.environment_id.clone();
        record.audience_id = scope.audience_id.clone();
        record.specificity = scope.specificity();
        record.scope_key = scope.scope_key();
        record.version += 1;
        record.updated_by = context.actor();
        record.updated_at = now_ts();

        let stored = record.clone();
        let updated = run_storage(&self.storage, move |storage| {
            let clash = storage.get_setting_by_scope(&stored.key, &stored.scope_key)?;
            if clash.is_some_and(|other| other.id != stored.id) {
                return Ok(false);
            }
            match storage.update_setting(&stored) {
                Ok(()) => Ok(true),
                Err(err) if is_unique_violation(&err) => Ok(false),
                Err(err) => Err(err),
            }
        })
        .await?;
        if !updated {
            return Err(ServiceError::invalid_request(
                "Setting key already exists in this scope",
            ));
        }
        self.audit
            .record(
                context,
                "update",
                "settings",
                Some(&record.id),
                json!({ "message": format!("Updated setting: {}", record.key) }),
            )
            .await;
        Ok(record)
    }

    pub async fn delete(&self, id: &str, context: &AuditContext) -> ServiceResult<()> {
        let record = self.get(id).await?;
        let target = record.id.clone();
        run_storage(&self.storage, move |storage| storage.delete_setting(&target)).await?;
        self.audit
            .record(
                context,
                "delete",
                "settings",
                Some(&record.id),
                json!({ "message": format!("Deleted setting: {}", record.key) }),
            )
            .await;
        Ok(())
    }

    /// 解析调用方所在维度；用户或受众查询失败时该维度按未设置处理。
    pub async fn caller_scope(&self, oid: Option<&str>, audience_key: Option<&str>) -> SettingScope {
        let mut scope = SettingScope::default();
        if let Some(oid) = oid.map(str::trim).filter(|value| !value.is_empty()) {
            let lookup = oid.to_string();
            match run_storage(&self.storage, move |storage| storage.find_user_by_oid(&lookup)).await {
                Ok(Some(user)) => {
                    scope.organization_id = user.organization_id;
                    scope.domain_id = user.domain_id;
                    scope.environment_id = user.environment_id;
                }
                Ok(None) => debug!("解析配置时未找到用户: {oid}"),
                Err(err) => warn!("解析配置时读取用户维度失败: oid={oid}, {err}"),
            }
        }
        if let Some(code) = audience_key.map(str::trim).filter(|value| !value.is_empty()) {
            let lookup = code.to_string();
            match run_storage(&self.storage, move |storage| {
                storage.get_master_by_code(MasterKind::Audience, &lookup)
            })
            .await
            {
                Ok(Some(audience)) if audience.is_active => scope.audience_id = Some(audience.id),
                Ok(_) => debug!("解析配置时受众不存在或已停用: {code}"),
                Err(err) => warn!("解析配置时读取受众失败: code={code}, {err}"),
            }
        }
        scope.normalized()
    }

    /// 解析失败不会抛出，候选查询出错时按未找到返回。
    pub async fn resolve(&self, request: &ResolveRequest, context: &AuditContext) -> ResolvedSetting {
        let key = request.key.trim().to_string();
        let scope = self
            .caller_scope(request.oid.as_deref(), request.audience_key.as_deref())
            .await;
        let query = scope.candidate_query(&key);
        let candidates = match run_storage(&self.storage, move |storage| {
            storage.query_setting_candidates(&query)
        })
        .await
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!("查询配置候选失败: key={key}, {err}");
                return ResolvedSetting::not_found(&key);
            }
        };
        let Some(best) = select_best(&candidates, &scope) else {
            self.audit
                .record(
                    context,
                    "resolve",
                    "settings",
                    None,
                    json!({ "message": format!("Setting '{key}' not found - using default") }),
                )
                .await;
            return ResolvedSetting::not_found(&key);
        };
        let resolved = ResolvedSetting::from_record(&key, best);
        self.audit
            .record(
                context,
                "resolve",
                "settings",
                Some(&best.id),
                json!({
                    "message": format!("Resolved setting '{key}' from {}", resolved.resolved_from)
                }),
            )
            .await;
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, scope: SettingScope, updated_at: f64) -> SettingRecord {
        SettingRecord {
            id: id.to_string(),
            key: "theme".to_string(),
            payload: json!(id),
            description: None,
            is_secret: false,
            specificity: scope.specificity(),
            scope_key: scope.scope_key(),
            organization_id: scope.organization_id,
            domain_id: scope.domain_id,
            environment_id: scope.environment_id,
            audience_id: scope.audience_id,
            version: 1,
            is_active: true,
            created_by: None,
            created_at: updated_at,
            updated_by: None,
            updated_at,
        }
    }

    fn scope(org: Option<&str>, domain: Option<&str>, env: Option<&str>, audience: Option<&str>) -> SettingScope {
        SettingScope {
            organization_id: org.map(str::to_string),
            domain_id: domain.map(str::to_string),
            environment_id: env.map(str::to_string),
            audience_id: audience.map(str::to_string),
        }
    }

    #[test]
    fn weights_follow_dimension_priority() {
        assert_eq!(scope(None, None, None, None).specificity(), 0);
        assert_eq!(scope(None, None, Some("e"), None).specificity(), 1);
        assert_eq!(scope(Some("o"), None, None, None).specificity(), 2);
        assert_eq!(scope(None, Some("d"), None, None).specificity(), 3);
        assert_eq!(scope(None, None, None, Some("a")).specificity(), 10);
        assert_eq!(scope(Some("o"), Some("d"), Some("e"), Some("a")).specificity(), 16);
        // 域与环境的组合高于组织单独限定，但低于任何受众限定。
        assert!(scope(None, Some("d"), Some("e"), None).specificity() > scope(Some("o"), None, None, None).specificity());
    }

    #[test]
    fn scope_key_and_description_are_stable() {
        let value = scope(Some("o"), None, None, Some("a"));
        assert_eq!(value.scope_key(), "o|-|-|a");
        assert_eq!(value.describe(), "Organization+Audience");
        assert_eq!(SettingScope::default().describe(), "Global");
        assert_eq!(
            scope(Some("  "), None, None, None).normalized(),
            SettingScope::default()
        );
    }

    #[test]
    fn select_best_prefers_specificity_then_recency_then_id() {
        let caller = scope(Some("o"), Some("d"), Some("e"), None);
        let rows = vec![
            row("global", scope(None, None, None, None), 9.0),
            row("env", scope(None, None, Some("e"), None), 9.0),
            row("org", scope(Some("o"), None, None, None), 1.0),
        ];
        assert_eq!(select_best(&rows, &caller).unwrap().id, "org");

        let ties = vec![
            row("b", scope(None, Some("d"), None, None), 5.0),
            row("a", scope(None, Some("d"), None, None), 5.0),
            row("c", scope(None, Some("d"), None, None), 4.0),
        ];
        assert_eq!(select_best(&ties, &caller).unwrap().id, "a");
    }

    #[test]
    fn select_best_skips_secret_inactive_and_mismatched_rows() {
        let caller = scope(Some("o"), None, None, None);
        let mut secret = row("secret", scope(Some("o"), None, None, None), 1.0);
        secret.is_secret = true;
        let mut inactive = row("inactive", scope(Some("o"), None, None, None), 1.0);
        inactive.is_active = false;
        let other = row("other-org", scope(Some("x"), None, None, None), 1.0);
        let global = row("global", scope(None, None, None, None), 1.0);
        let rows = vec![secret, inactive, other, global];
        assert_eq!(select_best(&rows, &caller).unwrap().id, "global");
        assert!(select_best(&rows[..3], &caller).is_none());
    }

    #[test]
    fn update_patch_distinguishes_null_from_missing() {
        let patch: SettingUpdate =
            serde_json::from_value(json!({ "domain_id": null, "payload": 3 })).unwrap();
        assert_eq!(patch.domain_id, Some(None));
        assert_eq!(patch.organization_id, None);
        assert_eq!(patch.payload, Some(json!(3)));
    }

    #[test]
    fn resolve_request_defaults_audience() {
        let request: ResolveRequest = serde_json::from_value(json!({ "key": "theme" })).unwrap();
        assert_eq!(request.audience_key.as_deref(), Some(DEFAULT_AUDIENCE_KEY));
        assert!(request.oid.is_none());
    }
}
