//! Per-workspace cache of provider declarations.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::SchedulerError;

/// External store of workspace provider declarations.
#[async_trait]
pub trait ProviderConfigSource: Send + Sync {
    async fn load(&self, workspace_id: &str) -> anyhow::Result<Vec<ProviderConfig>>;
}

/// In-memory [`ProviderConfigSource`]. Unknown workspaces have no providers.
#[derive(Default)]
pub struct StaticProviderSource {
    workspaces: RwLock<HashMap<String, Vec<ProviderConfig>>>,
}

impl StaticProviderSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workspace(mut self, workspace_id: impl Into<String>, providers: Vec<ProviderConfig>) -> Self {
        self.workspaces.get_mut().insert(workspace_id.into(), providers);
        self
    }

    /// Replace a workspace's declarations. Schedulers keep serving their
    /// cached copy until it expires or is invalidated.
    pub async fn set(&self, workspace_id: impl Into<String>, providers: Vec<ProviderConfig>) {
        self.workspaces.write().await.insert(workspace_id.into(), providers);
    }
}

#[async_trait]
impl ProviderConfigSource for StaticProviderSource {
    async fn load(&self, workspace_id: &str) -> anyhow::Result<Vec<ProviderConfig>> {
        Ok(self.workspaces.read().await.get(workspace_id).cloned().unwrap_or_default())
    }
}

struct CacheEntry {
    providers: Arc<Vec<ProviderConfig>>,
    inserted_at: Instant,
    expires_at: Instant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_entries: usize,
    pub ttl_ms: u64,
}

/// TTL cache in front of a [`ProviderConfigSource`], bounded to
/// `max_entries` workspaces with oldest-first eviction.
pub struct ProviderCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ProviderCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cached declarations for `workspace_id`, loading them on a miss.
    pub async fn get_or_load(
        &self,
        workspace_id: &str,
        source: &dyn ProviderConfigSource,
    ) -> Result<Arc<Vec<ProviderConfig>>, SchedulerError> {
        {
            let entries = self.entries.lock().await;
            if let Some(entry) = entries.get(workspace_id) {
                if entry.expires_at > Instant::now() {
                    debug!(workspace = workspace_id, "provider config cache hit");
                    return Ok(entry.providers.clone());
                }
            }
        }

        let providers = source
            .load(workspace_id)
            .await
            .map_err(|e| SchedulerError::ConfigSource {
                workspace_id: workspace_id.to_string(),
                message: e.to_string(),
            })?;
        let providers = Arc::new(providers);
        debug!(workspace = workspace_id, count = providers.len(), "loaded provider config");

        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, e| e.expires_at > now);
        entries.insert(
            workspace_id.to_string(),
            CacheEntry {
                providers: providers.clone(),
                inserted_at: now,
                expires_at: now + self.ttl,
            },
        );
        while entries.len() > self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    debug!(workspace = %key, "evicting provider config");
                    entries.remove(&key);
                }
                None => break,
            }
        }
        Ok(providers)
    }

    /// Drop the cached declarations for one workspace. Returns whether an
    /// entry existed.
    pub async fn invalidate(&self, workspace_id: &str) -> bool {
        self.entries.lock().await.remove(workspace_id).is_some()
    }

    pub async fn clear_all(&self) {
        self.entries.lock().await.clear();
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.lock().await.len(),
            max_entries: self.max_entries,
            ttl_ms: self.ttl.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        inner: StaticProviderSource,
        loads: AtomicUsize,
    }

    impl CountingSource {
        fn new() -> Self {
            Self {
                inner: StaticProviderSource::new()
                    .with_workspace("w1", vec![ProviderConfig::ollama("gpu", "http://gpu:11434", 16.0)]),
                loads: AtomicUsize::new(0),
            }
        }

        fn loads(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderConfigSource for CountingSource {
        async fn load(&self, workspace_id: &str) -> anyhow::Result<Vec<ProviderConfig>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.load(workspace_id).await
        }
    }

    struct FailingSource;

    #[async_trait]
    impl ProviderConfigSource for FailingSource {
        async fn load(&self, _workspace_id: &str) -> anyhow::Result<Vec<ProviderConfig>> {
            anyhow::bail!("database unavailable")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn serves_from_cache_until_ttl() {
        let source = CountingSource::new();
        let cache = ProviderCache::new(Duration::from_secs(60), 10);

        let first = cache.get_or_load("w1", &source).await.unwrap();
        assert_eq!(first.len(), 1);
        cache.get_or_load("w1", &source).await.unwrap();
        assert_eq!(source.loads(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        cache.get_or_load("w1", &source).await.unwrap();
        assert_eq!(source.loads(), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_reload() {
        let source = CountingSource::new();
        let cache = ProviderCache::new(Duration::from_secs(60), 10);
        cache.get_or_load("w1", &source).await.unwrap();
        source
            .inner
            .set("w1", vec![ProviderConfig::openai("hosted", "sk-1")])
            .await;
        assert_eq!(cache.get_or_load("w1", &source).await.unwrap()[0].name, "gpu");

        assert!(cache.invalidate("w1").await);
        assert!(!cache.invalidate("w1").await);
        assert_eq!(cache.get_or_load("w1", &source).await.unwrap()[0].name, "hosted");
        assert_eq!(source.loads(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_oldest_entry() {
        let source = CountingSource::new();
        let cache = ProviderCache::new(Duration::from_secs(60), 2);
        for ws in ["a", "b", "c"] {
            cache.get_or_load(ws, &source).await.unwrap();
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.stats().await.size, 2);
        assert!(!cache.invalidate("a").await);
        assert!(cache.invalidate("b").await);
    }

    #[tokio::test]
    async fn source_failures_are_configuration_errors() {
        let cache = ProviderCache::new(Duration::from_secs(60), 2);
        let err = cache.get_or_load("w1", &FailingSource).await.unwrap_err();
        assert!(matches!(err, SchedulerError::ConfigSource { .. }));
        assert_eq!(cache.stats().await.size, 0);
    }

    #[tokio::test]
    async fn stats_and_clear() {
        let source = CountingSource::new();
        let cache = ProviderCache::new(Duration::from_secs(60), 100);
        cache.get_or_load("w1", &source).await.unwrap();
        assert_eq!(
            cache.stats().await,
            CacheStats {
                size: 1,
                max_entries: 100,
                ttl_ms: 60_000
            }
        );
        cache.clear_all().await;
        assert_eq!(cache.stats().await.size, 0);
    }
}
