//! Worker registry - every worker the control process knows about

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::{info, warn};

use crate::core::{Error, Result, SlotId, WorkerId, WorkerInstance, WorkerState};

/// Single writer (the dispatcher), many readers (status queries).
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<WorkerId, WorkerInstance>>,
    changed: Notify,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fully created worker.
    pub fn insert(&self, instance: WorkerInstance) -> Result<()> {
        let mut workers = self.workers.write();
        if workers.contains_key(&instance.id) {
            return Err(Error::WorkerCreation(format!("worker {} already registered", instance.id)));
        }
        workers.insert(instance.id, instance);
        drop(workers);
        self.changed.notify_waiters();
        Ok(())
    }

    pub fn get(&self, id: &WorkerId) -> Option<WorkerInstance> {
        self.workers.read().get(id).cloned()
    }

    /// Snapshot, oldest first
    pub fn list(&self) -> Vec<WorkerInstance> {
        let mut all: Vec<_> = self.workers.read().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    /// Move a worker to `to`, refusing transitions the lifecycle forbids.
    pub fn transition(&self, id: &WorkerId, to: WorkerState, reason: Option<String>) -> Result<WorkerInstance> {
        let mut workers = self.workers.write();
        let worker = workers
            .get_mut(id)
            .ok_or_else(|| Error::UnknownWorker(id.to_string()))?;
        if !worker.state.can_transition(to) {
            return Err(Error::Lifecycle(format!(
                "worker {} cannot go from {} to {}",
                id, worker.state, to
            )));
        }
        worker.state = to;
        worker.updated_at = Utc::now();
        if reason.is_some() {
            worker.reason = reason;
        }
        let snapshot = worker.clone();
        drop(workers);
        self.changed.notify_waiters();
        Ok(snapshot)
    }

    /// Every active worker on `slot` becomes `Lost`.
    pub fn mark_lost_on_slot(&self, slot: SlotId, reason: &str) -> Vec<WorkerId> {
        let mut lost = vec![];
        {
            let mut workers = self.workers.write();
            let now = Utc::now();
            for worker in workers.values_mut() {
                if worker.slot == slot && worker.state.is_active() {
                    worker.state = WorkerState::Lost;
                    worker.updated_at = now;
                    worker.reason = Some(reason.to_string());
                    lost.push(worker.id);
                }
            }
        }
        for id in &lost {
            warn!("👻 Worker {} lost with {}: {}", id, slot, reason);
        }
        if !lost.is_empty() {
            self.changed.notify_waiters();
        }
        lost
    }

    pub fn remove(&self, id: &WorkerId) -> Option<WorkerInstance> {
        let removed = self.workers.write().remove(id);
        if removed.is_some() {
            self.changed.notify_waiters();
        }
        removed
    }

    /// Drop terminal records. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut workers = self.workers.write();
        let before = workers.len();
        workers.retain(|_, w| !w.state.is_terminal());
        let pruned = before - workers.len();
        if pruned > 0 {
            info!("Pruned {} finished workers", pruned);
        }
        pruned
    }

    /// Workers still occupying a slot (`Running` or `Stopping`)
    pub fn active_count(&self) -> usize {
        self.workers
            .read()
            .values()
            .filter(|w| w.state.is_active())
            .count()
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }

    /// Fires on every mutation.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    pub(crate) fn notify(&self) {
        self.changed.notify_waiters();
    }
}
