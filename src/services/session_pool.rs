// 会话池：按 (租户, 用户) 惰性创建模型会话，定时回收空闲会话。
use crate::auth::Principal;
use crate::config::SessionsConfig;
use crate::services::llm::{is_connection_fatal, ProviderFactory};
use crate::services::model_session::{now_ms, ModelSession, ModelSessionInfo};
use crate::services::plugins::PluginRegistry;
use anyhow::Result;
use futures::future::join_all;
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TenantStats {
    pub count: usize,
    pub total_access_count: u64,
    pub avg_uptime_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub total_kernels: usize,
    pub active_kernels: Vec<ModelSessionInfo>,
    pub tenant_stats: BTreeMap<String, TenantStats>,
    pub max_idle_time_seconds: u64,
    pub cleanup_interval_seconds: u64,
}

struct Sweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct SessionPool {
    config: SessionsConfig,
    registry: Arc<PluginRegistry>,
    factory: Arc<dyn ProviderFactory>,
    sessions: Mutex<HashMap<String, Arc<ModelSession>>>,
    sweeper: SyncMutex<Option<Sweeper>>,
}

impl SessionPool {
    pub fn new(
        config: SessionsConfig,
        registry: Arc<PluginRegistry>,
        factory: Arc<dyn ProviderFactory>,
    ) -> Self {
        Self {
            config,
            registry,
            factory,
            sessions: Mutex::new(HashMap::new()),
            sweeper: SyncMutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    fn max_idle_ms(&self) -> i64 {
        i64::try_from(self.config.max_idle_s.saturating_mul(1000)).unwrap_or(i64::MAX)
    }

    /// 取得调用方的会话，不存在时在池锁内创建；访问计数在锁外更新。
    pub async fn acquire(&self, principal: &Principal) -> Result<Arc<ModelSession>> {
        let registry = self.registry.clone();
        registry.init().await;
        let normalized = Principal::new(principal.user_id.trim(), principal.tenant_id.trim());
        let key = normalized.pool_key();
        let session = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    let binding = self.factory.create(&normalized)?;
                    let session = Arc::new(ModelSession::new(normalized, binding, registry));
                    info!("创建模型会话: key={key}, session={}", session.id());
                    sessions.insert(key, session.clone());
                    session
                }
            }
        };
        session.touch(now_ms());
        Ok(session)
    }

    /// 使用会话执行一次操作，连接级错误会让该会话出池。
    pub async fn with_session<T, F, Fut>(&self, principal: &Principal, op: F) -> Result<T>
    where
        F: FnOnce(Arc<ModelSession>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let session = self.acquire(principal).await?;
        let result = op(session.clone()).await;
        if let Err(err) = &result {
            self.release_on_fatal_error(&session, err).await;
        }
        result
    }

    /// 错误为连接级时移除并关闭该会话，返回是否已移除。
    pub async fn release_on_fatal_error(&self, session: &Arc<ModelSession>, err: &anyhow::Error) -> bool {
        if !is_connection_fatal(err) {
            return false;
        }
        warn!(
            "模型会话连接异常，移出会话池: session={}, {err}",
            session.id()
        );
        self.remove_session(session).await
    }

    /// 仅当池中仍是同一实例时才移除，避免误关新建的会话。
    pub async fn remove_session(&self, session: &Arc<ModelSession>) -> bool {
        let key = session.principal().pool_key();
        let mut sessions = self.sessions.lock().await;
        let same = sessions
            .get(&key)
            .map(|current| Arc::ptr_eq(current, session))
            .unwrap_or(false);
        if !same {
            return false;
        }
        if let Some(removed) = sessions.remove(&key) {
            removed.shutdown().await;
        }
        true
    }

    pub async fn remove(&self, principal: &Principal) -> bool {
        let key = principal.pool_key();
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.remove(&key) else {
            return false;
        };
        session.shutdown().await;
        info!("移除模型会话: key={key}, session={}", session.id());
        true
    }

    pub async fn contains(&self, principal: &Principal) -> bool {
        self.sessions.lock().await.contains_key(&principal.pool_key())
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn evict_idle(&self) -> usize {
        self.evict_idle_at(now_ms()).await
    }

    /// 空闲时长达到阈值的会话全部关闭并出池。
    pub async fn evict_idle_at(&self, now_ms: i64) -> usize {
        let threshold = self.max_idle_ms();
        let mut sessions = self.sessions.lock().await;
        let expired = sessions
            .iter()
            .filter(|(_, session)| session.idle_ms(now_ms) >= threshold)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in &expired {
            if let Some(session) = sessions.remove(key) {
                session.shutdown().await;
                debug!("回收空闲会话: key={key}, session={}", session.id());
            }
        }
        if !expired.is_empty() {
            info!("空闲会话回收完成: {} 个, 剩余 {}", expired.len(), sessions.len());
        }
        expired.len()
    }

    pub async fn metrics(&self) -> PoolMetrics {
        let snapshot = {
            let sessions = self.sessions.lock().await;
            sessions.values().cloned().collect::<Vec<_>>()
        };
        self.build_metrics(&snapshot, now_ms())
    }

    fn build_metrics(&self, sessions: &[Arc<ModelSession>], now_ms: i64) -> PoolMetrics {
        let mut active_kernels = sessions
            .iter()
            .map(|session| session.info(now_ms))
            .collect::<Vec<_>>();
        active_kernels.sort_by(|a, b| a.created_at.total_cmp(&b.created_at));
        let mut tenant_stats: BTreeMap<String, TenantStats> = BTreeMap::new();
        for info in &active_kernels {
            let entry = tenant_stats.entry(info.tenant_id.clone()).or_default();
            entry.count += 1;
            entry.total_access_count += info.access_count;
            entry.avg_uptime_seconds += info.uptime_seconds;
        }
        for stats in tenant_stats.values_mut() {
            if stats.count > 0 {
                stats.avg_uptime_seconds /= stats.count as f64;
            }
        }
        PoolMetrics {
            total_kernels: active_kernels.len(),
            active_kernels,
            tenant_stats,
            max_idle_time_seconds: self.config.max_idle_s,
            cleanup_interval_seconds: self.config.sweep_interval_s,
        }
    }

    /// 初始化插件注册表并启动空闲回收任务，重复调用只启动一次。
    pub async fn start(self: &Arc<Self>) {
        self.registry.init().await;
        let mut guard = self.sweeper.lock();
        if guard.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let period = Duration::from_secs(self.config.sweep_interval_s.max(1));
        let pool = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.evict_idle().await;
                    }
                }
            }
            debug!("空闲会话回收任务已退出");
        });
        *guard = Some(Sweeper { cancel, handle });
        info!(
            "会话池已启动: max_idle_s={}, sweep_interval_s={}",
            self.config.max_idle_s, self.config.sweep_interval_s
        );
    }

    /// 停止回收任务，并发关闭所有会话后关闭插件注册表。
    pub async fn stop(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.cancel.cancel();
            if let Err(err) = sweeper.handle.await {
                warn!("空闲会话回收任务退出异常: {err}");
            }
        }
        let drained = {
            let mut sessions = self.sessions.lock().await;
            std::mem::take(&mut *sessions)
        };
        let count = drained.len();
        join_all(drained.into_values().map(|session| async move {
            session.shutdown().await;
        }))
        .await;
        self.registry.close().await;
        info!("会话池已停止: 关闭 {count} 个会话");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm::{EchoProvider, ProviderBinding};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFactory {
        created: AtomicUsize,
    }

    impl ProviderFactory for CountingFactory {
        fn create(&self, _principal: &Principal) -> Result<ProviderBinding> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(ProviderBinding {
                provider: Arc::new(EchoProvider),
                sanitizer: None,
            })
        }
    }

    fn pool(max_idle_s: u64) -> (Arc<SessionPool>, Arc<CountingFactory>) {
        let factory = Arc::new(CountingFactory {
            created: AtomicUsize::new(0),
        });
        let pool = SessionPool::new(
            SessionsConfig {
                max_idle_s,
                sweep_interval_s: 60,
            },
            Arc::new(PluginRegistry::with_plugins(Vec::new())),
            factory.clone(),
        );
        (Arc::new(pool), factory)
    }

    #[tokio::test]
    async fn user_id_is_trimmed_before_lookup() {
        let (pool, factory) = pool(60);
        let first = pool.acquire(&Principal::new(" u1 ", "t1")).await.unwrap();
        let second = pool.acquire(&Principal::new("u1", "t1")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.principal().user_id, "u1");
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(second.access_count(), 2);
    }

    #[tokio::test]
    async fn metrics_aggregate_per_tenant() {
        let (pool, _) = pool(60);
        pool.acquire(&Principal::new("a", "t1")).await.unwrap();
        pool.acquire(&Principal::new("a", "t1")).await.unwrap();
        pool.acquire(&Principal::new("b", "t1")).await.unwrap();
        pool.acquire(&Principal::new("c", "t2")).await.unwrap();
        let metrics = pool.metrics().await;
        assert_eq!(metrics.total_kernels, 3);
        assert_eq!(metrics.max_idle_time_seconds, 60);
        let t1 = metrics.tenant_stats.get("t1").unwrap();
        assert_eq!(t1.count, 2);
        assert_eq!(t1.total_access_count, 3);
        assert_eq!(metrics.tenant_stats.get("t2").unwrap().count, 1);
    }

    #[tokio::test]
    async fn remove_session_ignores_replaced_instance() {
        let (pool, _) = pool(60);
        let principal = Principal::new("u1", "t1");
        let stale = pool.acquire(&principal).await.unwrap();
        assert!(pool.remove(&principal).await);
        let fresh = pool.acquire(&principal).await.unwrap();
        assert!(!pool.remove_session(&stale).await);
        assert!(pool.contains(&principal).await);
        assert!(fresh.is_active());
        assert!(!stale.is_active());
    }

    #[tokio::test]
    async fn start_and_stop_drain_sessions() {
        let (pool, _) = pool(60);
        pool.start().await;
        pool.start().await;
        let session = pool.acquire(&Principal::new("u1", "t1")).await.unwrap();
        pool.stop().await;
        assert!(pool.is_empty().await);
        assert!(!session.is_active());
        assert!(pool.registry().is_initialized());
    }
}
