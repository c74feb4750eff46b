//! Lazily refreshed view of each instance's health, catalog and load.
//!
//! Every refresh is a no-op while its entry is younger than its TTL. Probe
//! failures never escape: they are recorded in the state (offline status,
//! missing catalog or load) for the selector to act on.

use llm::{Driver, ModelEntry, RunningModel};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::classifier::{classify, Workload};
use crate::config::{InstanceConfig, SchedulerConfig};
use crate::semaphore::AdmissionSlot;

#[derive(Clone, Debug)]
pub struct InstanceStatus {
    pub checked_at: Instant,
    pub online: bool,
    pub version: Option<String>,
    pub error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Catalog {
    pub checked_at: Instant,
    pub models: Vec<ModelEntry>,
}

#[derive(Clone, Debug)]
pub struct Load {
    pub checked_at: Instant,
    pub running: Vec<RunningModel>,
    pub total_vram_used: u64,
}

impl Load {
    fn new(running: Vec<RunningModel>) -> Self {
        Self {
            checked_at: Instant::now(),
            total_vram_used: running.iter().map(|m| m.vram_bytes).sum(),
            running,
        }
    }
}

/// Everything the scheduler knows about one instance.
pub struct InstanceState {
    pub config: InstanceConfig,
    pub status: InstanceStatus,
    pub catalog: Option<Catalog>,
    pub load: Option<Load>,
    pub(crate) admission: HashMap<String, Arc<AdmissionSlot>>,
}

impl InstanceState {
    pub fn new(config: InstanceConfig, status: InstanceStatus) -> Self {
        Self {
            config,
            status,
            catalog: None,
            load: None,
            admission: HashMap::new(),
        }
    }

    pub fn url(&self) -> &str {
        self.config.url()
    }

    /// Catalog entry for `model`, if advertised.
    pub fn model(&self, model: &str) -> Option<&ModelEntry> {
        self.catalog
            .as_ref()?
            .models
            .iter()
            .find(|m| same_model(&m.name, model))
    }

    pub fn is_resident(&self, model: &str) -> bool {
        self.load
            .as_ref()
            .is_some_and(|l| l.running.iter().any(|m| same_model(&m.name, model)))
    }

    /// Online, advertising `model`, with load data present.
    pub fn is_eligible(&self, model: &str) -> bool {
        self.status.online && self.load.is_some() && self.model(model).is_some()
    }

    pub fn admission_slots(&self) -> impl Iterator<Item = (&String, &Arc<AdmissionSlot>)> {
        self.admission.iter()
    }

    /// Slot for `model`, sized to `max_permits`. An existing slot whose bound
    /// changed gets a fresh gate.
    pub(crate) fn admission_for(&mut self, model: &str, max_permits: usize) -> Arc<AdmissionSlot> {
        let slot = self
            .admission
            .entry(model.to_string())
            .or_insert_with(|| Arc::new(AdmissionSlot::new(max_permits)))
            .clone();
        if slot.resize(max_permits) {
            debug!(instance = %self.config.url(), model, max_permits, "admission bound changed");
        }
        slot
    }
}

/// Model names match exactly, or when one side omits the implicit
/// `:latest` tag.
pub fn same_model(candidate: &str, requested: &str) -> bool {
    candidate == requested
        || candidate.strip_suffix(":latest") == Some(requested)
        || requested.strip_suffix(":latest") == Some(candidate)
}

fn is_fresh(checked_at: Instant, ttl: Duration) -> bool {
    checked_at.elapsed() < ttl
}

/// Runs the health, catalog and load probes for one provider's instances.
pub struct Monitor {
    driver: Arc<dyn Driver>,
    status_ttl: Duration,
    catalog_ttl: Duration,
    load_ttl: Duration,
}

impl Monitor {
    pub fn new(driver: Arc<dyn Driver>, config: &SchedulerConfig) -> Self {
        Self {
            driver,
            status_ttl: config.status_ttl,
            catalog_ttl: config.catalog_ttl,
            load_ttl: config.load_ttl,
        }
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Probe liveness without touching any state.
    pub async fn probe_status(&self, config: &InstanceConfig) -> InstanceStatus {
        match self.driver.get_status(&config.endpoint).await {
            Ok(version) => InstanceStatus {
                checked_at: Instant::now(),
                online: true,
                version: version.version,
                error: None,
            },
            Err(e) => {
                warn!(instance = %config.url(), error = %e, "instance offline");
                InstanceStatus {
                    checked_at: Instant::now(),
                    online: false,
                    version: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    pub async fn refresh_status(&self, state: &mut InstanceState) {
        if is_fresh(state.status.checked_at, self.status_ttl) {
            return;
        }
        debug!(instance = %state.url(), "refreshing status");
        state.status = self.probe_status(&state.config).await;
    }

    pub async fn refresh_catalog(&self, state: &mut InstanceState) {
        if !state.status.online {
            state.catalog = None;
            return;
        }
        if state.catalog.as_ref().is_some_and(|c| is_fresh(c.checked_at, self.catalog_ttl)) {
            return;
        }
        debug!(instance = %state.url(), "refreshing catalog");
        state.catalog = match self.driver.list_models(&state.config.endpoint).await {
            Ok(models) => Some(Catalog {
                checked_at: Instant::now(),
                models,
            }),
            Err(e) => {
                warn!(instance = %state.url(), error = %e, "catalog refresh failed");
                None
            }
        };
    }

    pub async fn refresh_load(&self, state: &mut InstanceState) {
        if !state.status.online {
            state.load = None;
            return;
        }
        if state.load.as_ref().is_some_and(|l| is_fresh(l.checked_at, self.load_ttl)) {
            return;
        }
        debug!(instance = %state.url(), "refreshing load");
        state.load = match self.driver.get_running_models(&state.config.endpoint).await {
            Ok(running) => Some(Load::new(running)),
            Err(e) => {
                warn!(instance = %state.url(), error = %e, "load refresh failed");
                None
            }
        };
    }

    pub async fn refresh_all(&self, state: &mut InstanceState) {
        self.refresh_status(state).await;
        self.refresh_catalog(state).await;
        self.refresh_load(state).await;
    }
}

/// Admission estimate for one (instance, model) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capacity {
    pub configured_vram: u64,
    pub used_vram: u64,
    pub model_size: u64,
    pub model_resident: bool,
    /// Budget left after the model is resident. Negative when overcommitted.
    pub available_vram: i64,
    pub safety_margin: u64,
    pub max_permits: usize,
}

/// Size admission for `model` on `state`.
///
/// Providers that report no VRAM use the fixed hosted bound.
pub fn capacity(state: &InstanceState, model: &str, config: &SchedulerConfig) -> Capacity {
    let configured_vram = state.config.vram_budget_bytes;
    let used_vram = state.load.as_ref().map_or(0, |l| l.total_vram_used);
    let model_size = state.model(model).map_or(0, |m| m.size_bytes);
    let model_resident = state.is_resident(model);
    let available_vram = configured_vram as i64
        - used_vram as i64
        - if model_resident { 0 } else { model_size as i64 };
    let safety_margin = (configured_vram as f64 * config.safety_margin) as u64;

    let max_permits = if state.config.provider.is_self_hosted() {
        let cost = match classify(model).workload() {
            Workload::Vision => config.request_cost.vision_bytes,
            Workload::Embedding => config.request_cost.embedding_bytes,
            Workload::Chat => config.request_cost.chat_bytes,
        }
        .max(1);
        let headroom = available_vram - safety_margin as i64;
        if headroom <= 0 {
            1
        } else {
            ((headroom as u64 / cost) as usize).max(1)
        }
    } else {
        config.hosted_max_permits.max(1)
    };

    Capacity {
        configured_vram,
        used_vram,
        model_size,
        model_resident,
        available_vram,
        safety_margin,
        max_permits,
    }
}
