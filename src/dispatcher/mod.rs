//! Dispatcher - places workers on slots and drives their lifecycle
//!
//! Creation is atomic from the caller's side: a worker is registered only
//! once its slot has acknowledged it, and every failure path gives the slot
//! reservation back.

pub mod registry;

pub use registry::WorkerRegistry;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::core::{
    ConfigMap, Error, Result, SlotId, SlotState, WorkerId, WorkerInstance, WorkerSpec, WorkerState,
};
use crate::ipc::{Payload, Target};
use crate::slots::ProcessSlotManager;

pub struct Dispatcher {
    catalog: Arc<Catalog>,
    slots: Arc<ProcessSlotManager>,
    registry: Arc<WorkerRegistry>,
    /// `[components.<name>]` tables forwarded with each creation
    settings: BTreeMap<String, ConfigMap>,
    ack_timeout: Duration,
    stop_timeout: Duration,
    accepting: AtomicBool,
    in_flight: AtomicUsize,
    creations: Mutex<Creations>,
    /// Lost workers whose slot reservation is still taken
    held: Mutex<HashMap<WorkerId, SlotId>>,
}

/// Workers sent to a slot but not registered yet, and exits they reported
/// in the meantime.
#[derive(Default)]
struct Creations {
    pending: HashSet<WorkerId>,
    exited: HashMap<WorkerId, String>,
}

/// Tracks one creation awaiting its slot; forgotten on drop.
struct PendingCreation<'a> {
    dispatcher: &'a Dispatcher,
    id: WorkerId,
}

impl<'a> PendingCreation<'a> {
    fn enter(dispatcher: &'a Dispatcher, id: WorkerId) -> Self {
        dispatcher.creations.lock().pending.insert(id);
        Self { dispatcher, id }
    }

    /// Stop tracking; returns the exit reason if the worker already ended.
    fn settle(&self) -> Option<String> {
        let mut creations = self.dispatcher.creations.lock();
        creations.pending.remove(&self.id);
        creations.exited.remove(&self.id)
    }
}

impl Drop for PendingCreation<'_> {
    fn drop(&mut self) {
        let _ = self.settle();
    }
}

/// Counts a creation in progress for as long as it lives.
struct InFlight<'a>(&'a Dispatcher);

impl<'a> InFlight<'a> {
    fn enter(dispatcher: &'a Dispatcher) -> Self {
        dispatcher.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(dispatcher)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.0.registry.notify();
    }
}

impl Dispatcher {
    pub fn new(
        catalog: Arc<Catalog>,
        slots: Arc<ProcessSlotManager>,
        settings: BTreeMap<String, ConfigMap>,
        ack_timeout: Duration,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            slots,
            registry: Arc::new(WorkerRegistry::new()),
            settings,
            ack_timeout,
            stop_timeout,
            accepting: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            creations: Mutex::new(Creations::default()),
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Refuse new workers from now on.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Place and start a worker.
    pub async fn create_worker(&self, spec: WorkerSpec) -> Result<WorkerId> {
        if !self.is_accepting() {
            return Err(Error::Lifecycle("not accepting new workers".into()));
        }
        let _in_flight = InFlight::enter(self);

        if !self.catalog.strategies.contains(&spec.strategy) {
            return Err(Error::UnknownStrategy(spec.strategy.clone()));
        }
        let requirements = self.catalog.components.validate(&spec)?;

        let slot = self.slots.acquire_slot(requirements).await?;
        let id = WorkerId::new();
        debug!("Placing worker {} ({}) on {}", id, spec.strategy, slot);
        let pending = PendingCreation::enter(self, id);

        let Some(channel) = self.slots.channel(slot) else {
            self.slots.release_slot(slot);
            return Err(Error::Transport(format!("{slot} has no channel")));
        };

        let settings = spec
            .components
            .iter()
            .filter_map(|name| self.settings.get(name).map(|c| (name.clone(), c.clone())))
            .collect();
        let command = Payload::CreateWorker {
            worker: id,
            spec: spec.clone(),
            settings,
        };

        let components = match channel.request(Target::Slot(slot), command, self.ack_timeout).await {
            Ok(Payload::Created { components, .. }) => components,
            Ok(other) => {
                self.slots.release_slot(slot);
                let _ = channel.notify(Target::Slot(slot), Payload::AbortWorker { worker: id });
                return Err(Error::WorkerCreation(format!("unexpected {} answer", other.name())));
            }
            Err(e) => {
                self.slots.release_slot(slot);
                if matches!(e, Error::Timeout { .. }) {
                    let _ = channel.notify(Target::Slot(slot), Payload::AbortWorker { worker: id });
                }
                warn!("Worker creation on {} failed: {}", slot, e);
                return Err(match e {
                    e @ (Error::UnknownStrategy(_)
                    | Error::UnknownComponent(_)
                    | Error::Placement(_)
                    | Error::Timeout { .. }
                    | Error::Transport(_)
                    | Error::WorkerCreation(_)) => e,
                    other => Error::WorkerCreation(other.to_string()),
                });
            }
        };

        let now = Utc::now();
        self.registry.insert(WorkerInstance {
            id,
            spec,
            slot,
            state: WorkerState::Running,
            components,
            created_at: now,
            updated_at: now,
            reason: None,
        })?;

        if let Some(reason) = pending.settle() {
            info!("Worker {} on {} exited before it was registered: {}", id, slot, reason);
            self.finish(id, slot, &reason);
            return Ok(id);
        }

        // The slot may have died between the ack and the insert
        if self
            .slots
            .slot(slot)
            .is_none_or(|s| s.state == SlotState::Terminated)
        {
            self.registry.mark_lost_on_slot(slot, "slot terminated during creation");
        } else {
            info!("🚀 Worker {} running on {}", id, slot);
        }
        Ok(id)
    }

    /// Cooperative stop. An unreachable slot leaves the worker `Lost` and the
    /// slot degraded.
    pub async fn stop_worker(&self, id: WorkerId) -> Result<()> {
        let worker = self
            .registry
            .get(&id)
            .ok_or_else(|| Error::UnknownWorker(id.to_string()))?;
        self.registry.transition(&id, WorkerState::Stopping, None)?;

        let Some(channel) = self.slots.channel(worker.slot) else {
            self.registry
                .transition(&id, WorkerState::Lost, Some("slot unreachable".into()))?;
            return Err(Error::Transport(format!("{} is gone", worker.slot)));
        };

        let outcome = channel
            .request(
                Target::Slot(worker.slot),
                Payload::StopWorker { worker: id },
                self.stop_timeout,
            )
            .await;

        match outcome {
            // the host no longer has it: it exited on its own meanwhile
            Ok(_) | Err(Error::UnknownWorker(_)) => {
                self.finish(id, worker.slot, "stopped");
                info!("🛑 Worker {} stopped", id);
                Ok(())
            }
            Err(e) => {
                if self
                    .registry
                    .transition(&id, WorkerState::Lost, Some(e.to_string()))
                    .is_ok()
                {
                    self.held.lock().insert(id, worker.slot);
                }
                let _ = self.slots.mark_degraded(worker.slot, &format!("stop of {id} failed: {e}"));
                Err(e)
            }
        }
    }

    /// Mark stopped and give the reservation back, once.
    fn finish(&self, id: WorkerId, slot: SlotId, reason: &str) {
        if self
            .registry
            .transition(&id, WorkerState::Stopped, Some(reason.to_string()))
            .is_ok()
        {
            self.slots.release_slot(slot);
        }
    }

    /// A worker ended on its own.
    pub fn on_worker_exited(&self, id: WorkerId, reason: &str) {
        {
            let mut creations = self.creations.lock();
            if creations.pending.contains(&id) {
                debug!("Worker {} exited while its creation is being confirmed", id);
                creations.exited.insert(id, reason.to_string());
                return;
            }
        }
        match self.registry.get(&id) {
            Some(worker) => {
                info!("Worker {} exited: {}", id, reason);
                self.finish(id, worker.slot, reason);
            }
            None => debug!("Exit of unknown worker {}", id),
        }
    }

    /// Every worker on a dead slot is lost.
    pub fn on_slot_terminated(&self, slot: SlotId, reason: &str) -> Vec<WorkerId> {
        // termination zeroes the slot's load
        self.held.lock().retain(|_, s| *s != slot);
        self.registry.mark_lost_on_slot(slot, reason)
    }

    /// Lost workers still holding a reservation on `slot`
    pub fn held_on(&self, slot: SlotId) -> Vec<WorkerId> {
        self.held
            .lock()
            .iter()
            .filter(|(_, s)| **s == slot)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Settle the reservations of lost workers on a slot that answers again.
    /// Workers the host no longer runs are simply released; ones it still
    /// runs are aborted first. Returns how many reservations were released.
    pub async fn reconcile(&self, slot: SlotId) -> Result<usize> {
        let lost = self.held_on(slot);
        if lost.is_empty() {
            return Ok(0);
        }
        let channel = self
            .slots
            .channel(slot)
            .ok_or_else(|| Error::Transport(format!("{slot} has no channel")))?;
        let running = match channel.request(Target::Slot(slot), Payload::Ping, self.ack_timeout).await? {
            Payload::Ack { data } => hosted_workers(&data),
            other => {
                return Err(Error::Transport(format!("unexpected {} answer to ping", other.name())));
            }
        };

        let mut released = 0;
        for id in lost {
            if self.held.lock().remove(&id).is_none() {
                continue;
            }
            if running.contains(&id) {
                info!("Aborting lost worker {} still running on {}", id, slot);
                let _ = channel.notify(Target::Slot(slot), Payload::AbortWorker { worker: id });
            }
            self.slots.release_slot(slot);
            released += 1;
        }
        if released > 0 {
            info!("♻️ {} released {} reservations of lost workers", slot, released);
        }
        Ok(released)
    }

    /// Create a fresh worker from a lost worker's spec and forget the lost one.
    pub async fn redispatch(&self, lost: WorkerId) -> Result<WorkerId> {
        let worker = self
            .registry
            .get(&lost)
            .ok_or_else(|| Error::UnknownWorker(lost.to_string()))?;
        if worker.state != WorkerState::Lost {
            return Err(Error::Lifecycle(format!(
                "worker {lost} is {}, only lost workers can be re-dispatched",
                worker.state
            )));
        }
        let id = self.create_worker(worker.spec).await?;
        self.registry.remove(&lost);
        info!("Worker {} re-dispatched as {}", lost, id);
        Ok(id)
    }

    /// Event for a running worker.
    pub fn deliver(&self, id: WorkerId, topic: &str, data: Value) -> Result<()> {
        let worker = self
            .registry
            .get(&id)
            .ok_or_else(|| Error::UnknownWorker(id.to_string()))?;
        if worker.state != WorkerState::Running {
            return Err(Error::Lifecycle(format!("worker {id} is {}", worker.state)));
        }
        let channel = self
            .slots
            .channel(worker.slot)
            .ok_or_else(|| Error::Transport(format!("{} is gone", worker.slot)))?;
        channel.notify(
            Target::Slot(worker.slot),
            Payload::Deliver {
                worker: id,
                topic: topic.to_string(),
                data,
            },
        )
    }

    pub fn list_workers(&self) -> Vec<WorkerInstance> {
        self.registry.list()
    }

    pub fn worker_status(&self, id: WorkerId) -> Result<WorkerInstance> {
        self.registry
            .get(&id)
            .ok_or_else(|| Error::UnknownWorker(id.to_string()))
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no creation is in flight and no worker is active.
    pub async fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let changed = self.registry.changed();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if self.in_flight() == 0 && self.registry.active_count() == 0 {
                return true;
            }
            match deadline {
                None => changed.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, changed).await.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

/// Worker ids listed in a host's ping answer
fn hosted_workers(data: &Value) -> HashSet<WorkerId> {
    data.get("workers")
        .cloned()
        .and_then(|v| serde_json::from_value::<Vec<WorkerId>>(v).ok())
        .unwrap_or_default()
        .into_iter()
        .collect()
}
