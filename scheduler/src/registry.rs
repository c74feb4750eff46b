//! Instance registry for one (workspace, provider) pair.
//!
//! The registry owns every [`InstanceState`] and reconciles them against the
//! declared instance list on each scheduling call. New instances are probed
//! before they become visible; undeclared ones are dropped.

use futures_util::future::join_all;
use llm::{Driver, ProviderKind};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::{InstanceConfig, SchedulerConfig};
use crate::monitor::{InstanceState, Monitor};
use crate::semaphore::AdmissionSlot;

pub type SharedInstance = Arc<Mutex<InstanceState>>;

pub struct Registry {
    provider: ProviderKind,
    pub(crate) monitor: Monitor,
    pub(crate) config: SchedulerConfig,
    instances: RwLock<BTreeMap<String, SharedInstance>>,
}

impl Registry {
    pub fn new(provider: ProviderKind, driver: Arc<dyn Driver>, config: SchedulerConfig) -> Self {
        Self {
            provider,
            monitor: Monitor::new(driver, &config),
            config,
            instances: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        self.monitor.driver()
    }

    /// Bring the registry in line with `declared`. Idempotent.
    pub async fn reconcile(&self, declared: &[InstanceConfig]) {
        let wanted: HashSet<&str> = declared.iter().map(|c| c.url()).collect();
        let mut existing = Vec::new();
        let mut added = Vec::new();
        {
            let mut instances = self.instances.write().await;
            instances.retain(|url, _| {
                let keep = wanted.contains(url.as_str());
                if !keep {
                    info!(provider = %self.provider, instance = %url, "instance removed");
                }
                keep
            });
            for config in declared {
                match instances.get(config.url()) {
                    Some(entry) => existing.push((entry.clone(), config)),
                    None => added.push(config),
                }
            }
        }

        for (entry, config) in existing {
            let mut state = entry.lock().await;
            if state.config != *config {
                debug!(instance = %config.url(), "instance config replaced");
                state.config = config.clone();
            }
        }

        if added.is_empty() {
            return;
        }
        let probed = join_all(added.into_iter().map(|config| async move {
            let status = self.monitor.probe_status(config).await;
            let mut state = InstanceState::new(config.clone(), status);
            self.monitor.refresh_catalog(&mut state).await;
            state
        }))
        .await;

        let mut instances = self.instances.write().await;
        for state in probed {
            let url = state.url().to_string();
            info!(
                provider = %self.provider,
                instance = %url,
                online = state.status.online,
                "instance added"
            );
            instances
                .entry(url)
                .or_insert_with(|| Arc::new(Mutex::new(state)));
        }
    }

    /// Refresh every instance whose entries are stale. Instances refresh
    /// concurrently; each holds its own lock while probing, so concurrent
    /// callers wait for the result instead of probing again.
    pub async fn refresh_all(&self) {
        let instances = self.instances().await;
        join_all(instances.iter().map(|entry| async move {
            let mut state = entry.lock().await;
            self.monitor.refresh_all(&mut state).await;
        }))
        .await;
    }

    /// Snapshot of the registered instances, ordered by URL.
    pub async fn instances(&self) -> Vec<SharedInstance> {
        self.instances.read().await.values().cloned().collect()
    }

    pub async fn get(&self, url: &str) -> Option<SharedInstance> {
        self.instances.read().await.get(url).cloned()
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Current admission slot for `(url, model)`, if one has been sized.
    pub async fn admission(&self, url: &str, model: &str) -> Option<Arc<AdmissionSlot>> {
        let entry = self.get(url).await?;
        let state = entry.lock().await;
        state.admission.get(model).cloned()
    }

    pub async fn clear(&self) {
        self.instances.write().await.clear();
    }
}
