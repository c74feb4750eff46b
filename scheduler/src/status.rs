//! Capacity view for dashboards and operators.

use chrono::{DateTime, Utc};
use llm::{ProviderKind, RunningModel};
use serde::Serialize;

use crate::classifier::{capabilities, Capability};
use crate::config::SchedulerConfig;
use crate::monitor::InstanceState;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelReport {
    pub name: String,
    pub size_bytes: u64,
    pub family: Option<String>,
    pub quantization: Option<String>,
    pub capabilities: Vec<Capability>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReport {
    pub model: String,
    pub max_permits: usize,
    pub permits_in_use: usize,
    pub queue_length: usize,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceReport {
    pub workspace_id: String,
    pub provider: ProviderKind,
    pub name: String,
    pub url: String,
    pub online: bool,
    /// Online with catalog and load data.
    pub healthy: bool,
    pub version: Option<String>,
    pub error: Option<String>,
    pub status_age_ms: u64,
    pub models: Vec<ModelReport>,
    pub running_models: Vec<RunningModel>,
    pub vram_budget_bytes: u64,
    pub vram_used_bytes: u64,
    pub vram_available_bytes: u64,
    pub safety_margin_bytes: u64,
    pub admission: Vec<AdmissionReport>,
    pub max_concurrency: usize,
    pub queue_length: usize,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub generated_at: DateTime<Utc>,
    pub instances: Vec<InstanceReport>,
    pub total_instances: usize,
    pub available_instances: usize,
    pub healthy_instances: usize,
    pub total_vram_bytes: u64,
    pub total_used_vram_bytes: u64,
    pub total_max_concurrency: usize,
    pub total_queue_length: usize,
}

impl ClusterStatus {
    pub fn new(instances: Vec<InstanceReport>) -> Self {
        Self {
            generated_at: Utc::now(),
            total_instances: instances.len(),
            available_instances: instances.iter().filter(|i| i.online).count(),
            healthy_instances: instances.iter().filter(|i| i.healthy).count(),
            total_vram_bytes: instances.iter().map(|i| i.vram_budget_bytes).sum(),
            total_used_vram_bytes: instances.iter().map(|i| i.vram_used_bytes).sum(),
            total_max_concurrency: instances.iter().map(|i| i.max_concurrency).sum(),
            total_queue_length: instances.iter().map(|i| i.queue_length).sum(),
            instances,
        }
    }
}

pub(crate) fn report_instance(workspace_id: &str, state: &InstanceState, config: &SchedulerConfig) -> InstanceReport {
    let models = state
        .catalog
        .as_ref()
        .map(|c| {
            c.models
                .iter()
                .map(|m| ModelReport {
                    name: m.name.clone(),
                    size_bytes: m.size_bytes,
                    family: m.family.clone(),
                    quantization: m.quantization.clone(),
                    capabilities: capabilities(&m.name),
                })
                .collect()
        })
        .unwrap_or_default();
    let running_models = state.load.as_ref().map(|l| l.running.clone()).unwrap_or_default();
    let vram_budget_bytes = state.config.vram_budget_bytes;
    let vram_used_bytes = state.load.as_ref().map_or(0, |l| l.total_vram_used);

    let mut admission: Vec<AdmissionReport> = state
        .admission_slots()
        .map(|(model, slot)| {
            let gate = slot.current();
            AdmissionReport {
                model: model.clone(),
                max_permits: gate.max_permits(),
                permits_in_use: gate.permits_in_use(),
                queue_length: gate.queue_length(),
            }
        })
        .collect();
    admission.sort_by(|a, b| a.model.cmp(&b.model));

    InstanceReport {
        workspace_id: workspace_id.to_string(),
        provider: state.config.provider,
        name: state.config.name.clone(),
        url: state.url().to_string(),
        online: state.status.online,
        healthy: state.status.online && state.catalog.is_some() && state.load.is_some(),
        version: state.status.version.clone(),
        error: state.status.error.clone(),
        status_age_ms: state.status.checked_at.elapsed().as_millis() as u64,
        models,
        running_models,
        vram_budget_bytes,
        vram_used_bytes,
        vram_available_bytes: vram_budget_bytes.saturating_sub(vram_used_bytes),
        safety_margin_bytes: (vram_budget_bytes as f64 * config.safety_margin) as u64,
        max_concurrency: admission.iter().map(|a| a.max_permits).sum(),
        queue_length: admission.iter().map(|a| a.queue_length).sum(),
        admission,
    }
}
