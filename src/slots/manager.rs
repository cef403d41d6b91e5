//! Process slot manager - the pool of worker-hosting processes
//!
//! Owns every slot's health state and load counter. All load mutations
//! happen under the manager's write lock so placement decisions are made
//! against a consistent snapshot.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::launcher::{SlotLauncher, SlotProcess};
use crate::core::{Error, NodeId, ProcessSlot, Result, SlotId, SlotLocation, SlotRequirements, SlotState};
use crate::ipc::{Channel, Inbound, Payload, Target};

/// Health transitions reported to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum SlotEvent {
    Degraded { slot: SlotId },
    Recovered { slot: SlotId },
    /// Every worker still placed on the slot is orphaned
    Terminated { slot: SlotId, reason: String },
}

#[derive(Debug, Default)]
pub struct InitReport {
    pub ready: Vec<SlotId>,
    pub failed: Vec<(SlotId, String)>,
}

struct SlotEntry {
    info: ProcessSlot,
    channel: Option<Channel>,
    process: Option<SlotProcess>,
    degraded_since: Option<Instant>,
}

impl SlotEntry {
    fn new(id: SlotId, location: SlotLocation, capacity: usize) -> Self {
        Self {
            info: ProcessSlot {
                id,
                location,
                capacity,
                load: 0,
                state: SlotState::Starting,
                started_at: Utc::now(),
            },
            channel: None,
            process: None,
            degraded_since: None,
        }
    }

    fn transition(&mut self, to: SlotState) -> Result<()> {
        if !self.info.state.can_transition(to) {
            return Err(Error::Lifecycle(format!(
                "{} cannot go from {} to {}",
                self.info.id, self.info.state, to
            )));
        }
        self.info.state = to;
        self.degraded_since = (to == SlotState::Degraded).then(Instant::now);
        Ok(())
    }
}

/// Pick the eligible slot with the most spare capacity; ties go to the
/// lowest load, then the lowest id.
pub fn select_slot<'a>(
    slots: impl IntoIterator<Item = &'a ProcessSlot>,
    requirements: &SlotRequirements,
) -> Option<SlotId> {
    slots
        .into_iter()
        .filter(|s| s.state == SlotState::Ready && s.load < s.capacity && requirements.accepts(s))
        .min_by_key(|s| (Reverse(s.spare()), s.load, s.id))
        .map(|s| s.id)
}

pub struct ProcessSlotManager {
    slots: RwLock<BTreeMap<SlotId, SlotEntry>>,
    next_id: AtomicU32,
    workers_per_slot: usize,
    acquire_wait: Option<Duration>,
    /// Bound on the graceful Shutdown round trip
    stop_timeout: Duration,
    inbound: flume::Sender<Inbound>,
    events: flume::Sender<SlotEvent>,
    freed: Notify,
}

impl ProcessSlotManager {
    pub fn new(
        workers_per_slot: usize,
        acquire_wait: Option<Duration>,
        stop_timeout: Duration,
        inbound: flume::Sender<Inbound>,
    ) -> (Arc<Self>, flume::Receiver<SlotEvent>) {
        let (events, events_rx) = flume::unbounded();
        let manager = Arc::new(Self {
            slots: RwLock::new(BTreeMap::new()),
            next_id: AtomicU32::new(0),
            workers_per_slot,
            acquire_wait,
            stop_timeout,
            inbound,
            events,
            freed: Notify::new(),
        });
        (manager, events_rx)
    }

    pub fn workers_per_slot(&self) -> usize {
        self.workers_per_slot
    }

    fn allocate(&self, location: SlotLocation) -> SlotId {
        let id = SlotId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.slots
            .write()
            .insert(id, SlotEntry::new(id, location, self.workers_per_slot));
        id
    }

    /// Start `count` local slots concurrently. A slot that fails to start is
    /// reported and marked `Terminated`; the others are unaffected.
    pub async fn initialize(self: &Arc<Self>, launcher: Arc<dyn SlotLauncher>, count: usize) -> InitReport {
        let ids: Vec<SlotId> = (0..count)
            .map(|_| self.allocate(SlotLocation::Local { pid: None }))
            .collect();

        let launches = ids.iter().map(|&id| {
            let launcher = launcher.clone();
            let capacity = self.workers_per_slot;
            async move { (id, launcher.launch(id, capacity).await) }
        });

        let mut report = InitReport::default();
        for (id, outcome) in futures::future::join_all(launches).await {
            match outcome {
                Ok(launched) => {
                    let channel = Channel::spawn(id.to_string(), launched.stream, self.inbound.clone());
                    let pid = launched.process.pid();
                    {
                        let mut slots = self.slots.write();
                        if let Some(entry) = slots.get_mut(&id) {
                            entry.info.location = SlotLocation::Local { pid };
                            entry.channel = Some(channel.clone());
                            entry.process = Some(launched.process);
                            let _ = entry.transition(SlotState::Ready);
                        }
                    }
                    self.watch(id, channel);
                    info!("✅ {} ready (pid {:?})", id, pid);
                    report.ready.push(id);
                }
                Err(e) => {
                    warn!("❌ {} failed to start: {}", id, e);
                    if let Some(entry) = self.slots.write().get_mut(&id) {
                        let _ = entry.transition(SlotState::Terminated);
                    }
                    report.failed.push((id, e.to_string()));
                }
            }
        }
        self.freed.notify_waiters();
        report
    }

    /// Terminate a local slot when its channel drops.
    fn watch(self: &Arc<Self>, id: SlotId, channel: Channel) {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            channel.closed().await;
            if let Some(manager) = manager.upgrade() {
                let reason = channel.closed_reason().unwrap_or_else(|| "channel closed".into());
                let _ = manager.terminate_slot(id, &reason);
            }
        });
    }

    /// Add `count` slots hosted by a remote node reachable over `channel`.
    pub fn register_remote_node(&self, node: &NodeId, count: usize, channel: Channel) -> Vec<SlotId> {
        let ids = self.allocate_remote(node, count);
        self.attach_remote(node, &ids, channel);
        ids
    }

    /// Reserve ids for a joining node. The slots stay `Starting` until
    /// `attach_remote`.
    pub fn allocate_remote(&self, node: &NodeId, count: usize) -> Vec<SlotId> {
        (0..count)
            .map(|_| self.allocate(SlotLocation::Remote { node: node.clone() }))
            .collect()
    }

    pub fn attach_remote(&self, node: &NodeId, ids: &[SlotId], channel: Channel) {
        {
            let mut slots = self.slots.write();
            for id in ids {
                if let Some(entry) = slots.get_mut(id) {
                    entry.channel = Some(channel.clone());
                    let _ = entry.transition(SlotState::Ready);
                }
            }
        }
        info!("🌐 Node {} contributed {} slots", node, ids.len());
        self.freed.notify_waiters();
    }

    /// Reserve room on the best eligible slot. Waits up to `acquire_wait`
    /// for capacity to free up, otherwise fails with a placement error.
    pub async fn acquire_slot(&self, requirements: SlotRequirements) -> Result<SlotId> {
        let deadline = self.acquire_wait.map(|wait| tokio::time::Instant::now() + wait);
        loop {
            let notified = self.freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(id) = self.try_acquire(&requirements) {
                return Ok(id);
            }
            let Some(deadline) = deadline else {
                return Err(Error::Placement("no slot with spare capacity".into()));
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::Placement(format!(
                    "no slot freed up within {:?}",
                    self.acquire_wait.unwrap_or_default()
                )));
            }
        }
    }

    fn try_acquire(&self, requirements: &SlotRequirements) -> Option<SlotId> {
        let mut slots = self.slots.write();
        let id = select_slot(slots.values().map(|e| &e.info), requirements)?;
        let entry = slots.get_mut(&id)?;
        entry.info.load += 1;
        debug!("Reserved {} ({}/{})", id, entry.info.load, entry.info.capacity);
        Some(id)
    }

    /// Give back one reservation. A draining slot that reaches zero load is
    /// closed gracefully.
    pub fn release_slot(self: &Arc<Self>, id: SlotId) {
        let close = {
            let mut slots = self.slots.write();
            let Some(entry) = slots.get_mut(&id) else { return };
            entry.info.load = entry.info.load.saturating_sub(1);
            debug!("Released {} ({}/{})", id, entry.info.load, entry.info.capacity);
            entry.info.state == SlotState::Draining && entry.info.load == 0
        };
        if close {
            self.close_gracefully(id);
        }
        self.freed.notify_waiters();
    }

    /// Stop placing workers on `id`; it closes once its workers are gone.
    pub fn drain_slot(self: &Arc<Self>, id: SlotId) -> Result<()> {
        let close = {
            let mut slots = self.slots.write();
            let entry = slots
                .get_mut(&id)
                .ok_or_else(|| Error::UnknownSlot(id.to_string()))?;
            if entry.info.state == SlotState::Draining {
                return Ok(());
            }
            entry.transition(SlotState::Draining)?;
            info!("{} draining ({} workers left)", id, entry.info.load);
            entry.info.load == 0
        };
        if close {
            self.close_gracefully(id);
        }
        Ok(())
    }

    fn close_gracefully(self: &Arc<Self>, id: SlotId) {
        let manager = self.clone();
        tokio::spawn(async move {
            let (channel, process, remote) = {
                let mut slots = manager.slots.write();
                let Some(entry) = slots.get_mut(&id) else { return };
                (
                    entry.channel.clone(),
                    entry.process.take(),
                    !entry.info.location.is_local(),
                )
            };
            if !remote && let Some(channel) = channel {
                if let Err(e) = channel.request(Target::Slot(id), Payload::Shutdown, manager.stop_timeout).await {
                    debug!("{} shutdown request: {}", id, e);
                }
                if let Some(process) = process {
                    process.reap(manager.stop_timeout).await;
                }
            }
            let _ = manager.terminate_slot(id, "drained");
        });
    }

    /// Force-stop a slot. Its workers are orphaned; the engine marks them
    /// lost. Terminating an already terminated slot is a no-op.
    pub fn terminate_slot(&self, id: SlotId, reason: &str) -> Result<()> {
        let (channel, process, local) = {
            let mut slots = self.slots.write();
            let entry = slots
                .get_mut(&id)
                .ok_or_else(|| Error::UnknownSlot(id.to_string()))?;
            if entry.info.state == SlotState::Terminated {
                return Ok(());
            }
            entry.transition(SlotState::Terminated)?;
            entry.info.load = 0;
            (
                entry.channel.take(),
                entry.process.take(),
                entry.info.location.is_local(),
            )
        };

        // Remote slots share their node's connection; the gateway owns it
        if local && let Some(channel) = channel {
            channel.close(format!("terminated: {reason}"));
        }
        if let Some(process) = process {
            process.kill();
        }
        warn!("💀 {} terminated: {}", id, reason);
        let _ = self.events.send(SlotEvent::Terminated {
            slot: id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Flag a slot as unhealthy; no new workers go there.
    pub fn mark_degraded(&self, id: SlotId, reason: &str) -> Result<()> {
        let mut slots = self.slots.write();
        let entry = slots
            .get_mut(&id)
            .ok_or_else(|| Error::UnknownSlot(id.to_string()))?;
        match entry.info.state {
            SlotState::Degraded => return Ok(()),
            SlotState::Ready => entry.transition(SlotState::Degraded)?,
            // draining or terminated slots take no new work anyway
            _ => return Ok(()),
        }
        warn!("⚠️ {} degraded: {}", id, reason);
        let _ = self.events.send(SlotEvent::Degraded { slot: id });
        Ok(())
    }

    pub fn recover(&self, id: SlotId) -> Result<()> {
        {
            let mut slots = self.slots.write();
            let entry = slots
                .get_mut(&id)
                .ok_or_else(|| Error::UnknownSlot(id.to_string()))?;
            if entry.info.state != SlotState::Degraded {
                return Ok(());
            }
            entry.transition(SlotState::Ready)?;
        }
        info!("{} recovered", id);
        let _ = self.events.send(SlotEvent::Recovered { slot: id });
        self.freed.notify_waiters();
        Ok(())
    }

    /// Probe degraded local slots: a slot that answers a ping recovers, one
    /// degraded for longer than `timeout` is terminated.
    pub async fn check_degraded(&self, probe_timeout: Duration, timeout: Duration) {
        let degraded: Vec<(SlotId, Option<Channel>, Duration)> = self
            .slots
            .read()
            .values()
            .filter(|e| e.info.state == SlotState::Degraded && e.info.location.is_local())
            .map(|e| {
                let since = e.degraded_since.map(|t| t.elapsed()).unwrap_or_default();
                (e.info.id, e.channel.clone(), since)
            })
            .collect();

        for (id, channel, since) in degraded {
            let alive = match channel {
                Some(channel) => channel
                    .request(Target::Slot(id), Payload::Ping, probe_timeout)
                    .await
                    .is_ok(),
                None => false,
            };
            if alive {
                let _ = self.recover(id);
            } else if since >= timeout {
                let _ = self.terminate_slot(id, "degraded for too long");
            }
        }
    }

    pub fn channel(&self, id: SlotId) -> Option<Channel> {
        self.slots.read().get(&id).and_then(|e| e.channel.clone())
    }

    pub fn slot(&self, id: SlotId) -> Option<ProcessSlot> {
        self.slots.read().get(&id).map(|e| e.info.clone())
    }

    pub fn snapshot(&self) -> Vec<ProcessSlot> {
        self.slots.read().values().map(|e| e.info.clone()).collect()
    }

    pub fn slots_of(&self, node: &NodeId) -> Vec<SlotId> {
        self.slots
            .read()
            .values()
            .filter(|e| matches!(&e.info.location, SlotLocation::Remote { node: n } if n == node))
            .map(|e| e.info.id)
            .collect()
    }

    /// Local slots currently `Ready` or `Degraded`
    pub fn local_live_count(&self) -> usize {
        self.slots
            .read()
            .values()
            .filter(|e| e.info.location.is_local() && e.info.state.is_live())
            .count()
    }

    /// Ask every local host to shut down, then terminate all slots.
    pub async fn shutdown_all(&self) {
        let targets: Vec<(SlotId, Channel)> = self
            .slots
            .read()
            .values()
            .filter(|e| e.info.state != SlotState::Terminated && e.info.location.is_local())
            .filter_map(|e| e.channel.clone().map(|c| (e.info.id, c)))
            .collect();

        let timeout = self.stop_timeout;
        futures::future::join_all(targets.iter().map(|(id, channel)| async move {
            if let Err(e) = channel.request(Target::Slot(*id), Payload::Shutdown, timeout).await {
                debug!("{} shutdown request: {}", id, e);
            }
        }))
        .await;

        let ids: Vec<SlotId> = self.slots.read().keys().copied().collect();
        for id in ids {
            let _ = self.terminate_slot(id, "engine shutdown");
        }
    }
}
