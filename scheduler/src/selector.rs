use std::cmp::Reverse;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::InstanceConfig;
use crate::error::SchedulerError;
use crate::monitor::{capacity, Capacity};
use crate::registry::Registry;
use crate::semaphore::AdmissionSlot;

/// Instance chosen for a request, with the gate the request must pass.
pub struct Selection {
    pub instance: InstanceConfig,
    pub admission: Arc<AdmissionSlot>,
    pub capacity: Capacity,
    pub queue_length: usize,
}

/// Ranking inputs for one eligible instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub url: String,
    pub queue_length: usize,
    pub available_vram: i64,
}

/// Order candidates best first: shortest admission queue, then most
/// available VRAM. Ties keep their input order.
pub fn rank(candidates: &mut [Candidate]) {
    candidates.sort_by_key(|c| (c.queue_length, Reverse(c.available_vram)));
}

impl Registry {
    /// Reconcile against `declared`, refresh stale state and pick the best
    /// instance for `model`.
    ///
    /// Nothing is reserved: the returned gate is the hard bound, so a racing
    /// caller may still queue behind this one.
    pub async fn select_best_instance(
        &self,
        declared: &[InstanceConfig],
        model: &str,
    ) -> Result<Selection, SchedulerError> {
        self.reconcile(declared).await;
        self.refresh_all().await;

        let mut candidates = Vec::new();
        let mut selections = Vec::new();
        for entry in self.instances().await {
            let mut state = entry.lock().await;
            if !state.is_eligible(model) {
                debug!(instance = %state.url(), model, online = state.status.online, "instance not eligible");
                continue;
            }
            let capacity = capacity(&state, model, &self.config);
            let admission = state.admission_for(model, capacity.max_permits);
            let queue_length = admission.queue_length();
            candidates.push(Candidate {
                url: state.url().to_string(),
                queue_length,
                available_vram: capacity.available_vram,
            });
            selections.push(Selection {
                instance: state.config.clone(),
                admission,
                capacity,
                queue_length,
            });
        }

        rank(&mut candidates);
        let best = candidates
            .first()
            .and_then(|best| selections.into_iter().find(|s| s.instance.url() == best.url))
            .ok_or_else(|| SchedulerError::NoAvailableInstance {
                model: model.to_string(),
            })?;
        info!(
            provider = %self.provider(),
            instance = %best.instance.url(),
            model,
            queue = best.queue_length,
            max_permits = best.capacity.max_permits,
            available_vram = best.capacity.available_vram,
            "selected instance"
        );
        Ok(best)
    }
}
