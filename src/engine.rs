//! Engine - the top-level façade
//!
//! Owns the component registry, the slot pool, the dispatcher and the
//! optional remote gateway, and routes worker-to-core traffic from every
//! slot to the core components.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::catalog::Catalog;
use crate::components::CoreSet;
use crate::core::config::IpcMode;
use crate::core::{
    EngineConfig, Error, ProcessSlot, RemoteNode, Result, SlotId, WorkerId, WorkerInstance, WorkerSpec, WorkerState,
};
use crate::dispatcher::Dispatcher;
use crate::gateway::RemoteGateway;
use crate::ipc::{Inbound, MessageKind, Payload, Target};
use crate::slots::{InProcessLauncher, LocalAcceptor, ProcessLauncher, ProcessSlotManager, SlotEvent, SlotLauncher};

/// How often degraded local slots are probed
const PROBE_PERIOD: Duration = Duration::from_secs(1);

/// Bound on one core component handling a worker event; the router waits
/// for it so events stay in order
const CORE_EVENT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Created,
    Starting,
    Running,
    /// No new workers; existing ones run to completion
    Draining,
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Created => "created",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Draining => "draining",
            EngineState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Read-only snapshot for monitoring collaborators
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub accepting: bool,
    pub slots: Vec<ProcessSlot>,
    pub workers: Vec<WorkerInstance>,
    pub nodes: Vec<RemoteNode>,
}

/// Everything that exists only between `start` and `shutdown`
struct Runtime {
    slots: Arc<ProcessSlotManager>,
    dispatcher: Arc<Dispatcher>,
    core: CoreSet,
    gateway: Option<Arc<RemoteGateway>>,
    _acceptor: Option<Arc<LocalAcceptor>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct Engine {
    config: EngineConfig,
    catalog: Arc<Catalog>,
    launcher: Option<Arc<dyn SlotLauncher>>,
    state: Mutex<EngineState>,
    runtime: Mutex<Option<Arc<Runtime>>>,
}

impl Engine {
    pub fn new(mut config: EngineConfig, catalog: Catalog) -> Self {
        config.ensure_auth_key();
        Self {
            config,
            catalog: Arc::new(catalog),
            launcher: None,
            state: Mutex::new(EngineState::Created),
            runtime: Mutex::new(None),
        }
    }

    /// Start local slots with `launcher` instead of the one `[ipc] mode` picks.
    pub fn with_launcher(mut self, launcher: Arc<dyn SlotLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    /// Create the root directories, build core components, start local
    /// slots and the gateway. A core component failure aborts startup.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != EngineState::Created {
                return Err(Error::Lifecycle(format!("engine is {}, cannot start", *state)));
            }
            *state = EngineState::Starting;
        }

        match self.boot().await {
            Ok(runtime) => {
                *self.runtime.lock() = Some(Arc::new(runtime));
                *self.state.lock() = EngineState::Running;
                info!("🦀 Engine running");
                Ok(())
            }
            Err(e) => {
                error!("Engine failed to start: {}", e);
                *self.state.lock() = EngineState::Created;
                Err(e)
            }
        }
    }

    async fn boot(&self) -> Result<Runtime> {
        let root = &self.config.engine.root_dir;
        for dir in [root.join("logs"), root.join("components")] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| Error::Config(format!("cannot create {}: {e}", dir.display())))?;
        }

        let core = self
            .catalog
            .components
            .instantiate_all_core(&self.config.components, root)
            .await?;

        match self.boot_slots(&core).await {
            Ok(runtime) => Ok(runtime),
            Err(e) => {
                core.clone().shutdown_all().await;
                Err(e)
            }
        }
    }

    async fn boot_slots(&self, core: &CoreSet) -> Result<Runtime> {
        let engine = &self.config.engine;
        let (inbound_tx, inbound_rx) = flume::unbounded();
        let (slots, slot_events) = ProcessSlotManager::new(
            engine.workers_per_slot,
            engine.acquire_wait(),
            engine.stop_timeout(),
            inbound_tx.clone(),
        );

        let (launcher, acceptor) = self.local_launcher().await?;
        let count = engine.local_slot_count();
        let report = slots.initialize(launcher, count).await;
        info!(
            "🧵 {}/{} local slots ready ({} workers each)",
            report.ready.len(),
            count,
            engine.workers_per_slot
        );
        for (slot, reason) in &report.failed {
            warn!("{} not started: {}", slot, reason);
        }

        let gateway = if self.config.gateway.enabled {
            let gateway = RemoteGateway::new(self.config.gateway.clone(), slots.clone(), inbound_tx.clone());
            if let Err(e) = gateway.start().await {
                slots.shutdown_all().await;
                return Err(e);
            }
            Some(gateway)
        } else {
            None
        };

        let dispatcher = Arc::new(Dispatcher::new(
            self.catalog.clone(),
            slots.clone(),
            self.config.components.clone(),
            engine.ack_timeout(),
            engine.stop_timeout(),
        ));

        let tasks = vec![
            tokio::spawn(route(inbound_rx, core.clone(), dispatcher.clone(), gateway.clone())),
            tokio::spawn(supervise(slot_events, dispatcher.clone())),
            tokio::spawn(probe_degraded(
                slots.clone(),
                engine.ack_timeout().min(PROBE_PERIOD),
                engine.degraded_timeout(),
            )),
        ];

        Ok(Runtime {
            slots,
            dispatcher,
            core: core.clone(),
            gateway,
            _acceptor: acceptor,
            tasks: Mutex::new(tasks),
        })
    }

    async fn local_launcher(&self) -> Result<(Arc<dyn SlotLauncher>, Option<Arc<LocalAcceptor>>)> {
        if let Some(launcher) = &self.launcher {
            return Ok((launcher.clone(), None));
        }
        let root = self.config.engine.root_dir.clone();
        match self.config.ipc.mode {
            IpcMode::InProcess => Ok((Arc::new(InProcessLauncher::new(self.catalog.clone(), root)), None)),
            IpcMode::Process => {
                let ipc = &self.config.ipc;
                let acceptor = Arc::new(LocalAcceptor::bind(&ipc.listen, &ipc.auth_key).await?);
                let binary = match &ipc.host_binary {
                    Some(path) => path.clone(),
                    None => std::env::current_exe()?,
                };
                let launcher = ProcessLauncher::new(
                    binary,
                    acceptor.clone(),
                    ipc.auth_key.clone(),
                    root,
                    ipc.launch_timeout(),
                );
                Ok((Arc::new(launcher), Some(acceptor)))
            }
        }
    }

    /// The runtime, if the engine accepts control operations.
    fn runtime(&self) -> Result<Arc<Runtime>> {
        let state = self.state();
        match state {
            EngineState::Running | EngineState::Draining => self
                .runtime
                .lock()
                .clone()
                .ok_or_else(|| Error::Lifecycle(format!("engine is {state}"))),
            _ => Err(Error::Lifecycle(format!("engine is {state}"))),
        }
    }

    /// The runtime for read-only queries, also after shutdown.
    fn observed(&self) -> Result<Arc<Runtime>> {
        self.runtime
            .lock()
            .clone()
            .ok_or_else(|| Error::Lifecycle(format!("engine is {}", self.state())))
    }

    pub async fn create_worker(&self, spec: WorkerSpec) -> Result<WorkerId> {
        self.runtime()?.dispatcher.create_worker(spec).await
    }

    pub async fn stop_worker(&self, id: WorkerId) -> Result<()> {
        self.runtime()?.dispatcher.stop_worker(id).await
    }

    pub async fn redispatch(&self, lost: WorkerId) -> Result<WorkerId> {
        self.runtime()?.dispatcher.redispatch(lost).await
    }

    /// Send an event to a running worker.
    pub fn deliver(&self, id: WorkerId, topic: &str, data: Value) -> Result<()> {
        self.runtime()?.dispatcher.deliver(id, topic, data)
    }

    pub fn list_workers(&self) -> Result<Vec<WorkerInstance>> {
        Ok(self.observed()?.dispatcher.list_workers())
    }

    pub fn worker_status(&self, id: WorkerId) -> Result<WorkerInstance> {
        self.observed()?.dispatcher.worker_status(id)
    }

    /// Forget stopped and lost workers.
    pub fn prune_workers(&self) -> Result<usize> {
        Ok(self.observed()?.dispatcher.registry().prune())
    }

    pub fn slots(&self) -> Result<Vec<ProcessSlot>> {
        Ok(self.observed()?.slots.snapshot())
    }

    pub fn drain_slot(&self, id: SlotId) -> Result<()> {
        self.runtime()?.slots.drain_slot(id)
    }

    /// Hard stop of one slot; its workers become lost.
    pub fn terminate_slot(&self, id: SlotId, reason: &str) -> Result<()> {
        let runtime = self.runtime()?;
        runtime.slots.terminate_slot(id, reason)?;
        runtime.dispatcher.on_slot_terminated(id, reason);
        Ok(())
    }

    pub fn status(&self) -> Result<EngineStatus> {
        let runtime = self.observed()?;
        Ok(EngineStatus {
            state: self.state(),
            accepting: runtime.dispatcher.is_accepting(),
            slots: runtime.slots.snapshot(),
            workers: runtime.dispatcher.list_workers(),
            nodes: runtime
                .gateway
                .as_ref()
                .map(|g| g.nodes())
                .unwrap_or_default(),
        })
    }

    /// A core component by name and concrete type.
    pub fn core_component<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.observed().ok()?.core.get_as::<T>(name)
    }

    pub fn gateway_addr(&self) -> Option<SocketAddr> {
        self.observed().ok()?.gateway.as_ref()?.addr()
    }

    /// Stop accepting new workers and wait for the existing ones to finish.
    pub async fn drain(&self) -> Result<()> {
        let runtime = self.runtime()?;
        {
            let mut state = self.state.lock();
            if *state == EngineState::Running {
                *state = EngineState::Draining;
            }
        }
        runtime.dispatcher.stop_accepting();
        info!(
            "Draining, waiting for {} workers",
            runtime.dispatcher.registry().active_count()
        );
        runtime.dispatcher.wait_idle(None).await;
        info!("✅ Engine drained");
        Ok(())
    }

    /// Stop every worker cooperatively, force whatever is left after
    /// `force_after`, then tear down slots, the gateway and core components.
    pub async fn shutdown(&self, force_after: Duration) -> Result<()> {
        let runtime = self.runtime()?;
        *self.state.lock() = EngineState::Draining;
        let dispatcher = &runtime.dispatcher;
        dispatcher.stop_accepting();

        let running: Vec<WorkerId> = dispatcher
            .list_workers()
            .into_iter()
            .filter(|w| w.state == WorkerState::Running)
            .map(|w| w.id)
            .collect();
        info!("🛑 Shutting down, stopping {} workers", running.len());

        let stops = futures::future::join_all(running.iter().map(|id| dispatcher.stop_worker(*id)));
        match tokio::time::timeout(force_after, stops).await {
            Ok(results) => {
                for e in results.into_iter().filter_map(|r| r.err()) {
                    warn!("Worker stop during shutdown failed: {}", e);
                }
            }
            Err(_) => warn!("Workers still running after {:?}, forcing", force_after),
        }
        if let Some(gateway) = &runtime.gateway {
            gateway.shutdown();
        }
        runtime.slots.shutdown_all().await;
        for slot in runtime.slots.snapshot() {
            dispatcher.on_slot_terminated(slot.id, "engine shutdown");
        }
        for task in runtime.tasks.lock().drain(..) {
            task.abort();
        }
        runtime.core.clone().shutdown_all().await;

        *self.state.lock() = EngineState::Stopped;
        info!("👋 Engine stopped");
        Ok(())
    }
}

/// Worker-to-core traffic from every slot and node.
async fn route(
    inbound: flume::Receiver<Inbound>,
    core: CoreSet,
    dispatcher: Arc<Dispatcher>,
    gateway: Option<Arc<RemoteGateway>>,
) {
    while let Ok(Inbound { channel, message }) = inbound.recv_async().await {
        match message.payload.clone() {
            Payload::CoreEvent {
                origin,
                component,
                topic,
                data,
            } => {
                match tokio::time::timeout(CORE_EVENT_TIMEOUT, core.on_event(&component, origin, &topic, data)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Event {} from {} to {} failed: {}", topic, origin, component, e),
                    Err(_) => warn!(
                        "Event {} from {} to {} took longer than {:?}, dropped",
                        topic, origin, component, CORE_EVENT_TIMEOUT
                    ),
                }
            }
            Payload::CoreCall {
                origin,
                component,
                method,
                data,
            } => {
                let core = core.clone();
                tokio::spawn(async move {
                    let reply = match core.call(&component, origin, &method, data).await {
                        Ok(data) => Payload::Ack { data },
                        Err(e) => Payload::Failed { error: e.to_remote() },
                    };
                    let _ = channel.respond(&message, Target::Worker(origin), reply);
                });
            }
            Payload::WorkerExited { worker, reason } => dispatcher.on_worker_exited(worker, &reason),
            Payload::Heartbeat {
                node,
                timestamp,
                current_load,
            } => match &gateway {
                Some(gateway) => {
                    if let Err(e) = gateway.on_heartbeat(&node, timestamp, current_load) {
                        warn!("{}", e);
                    }
                }
                None => debug!("Heartbeat from {} without a gateway", node),
            },
            other => {
                if message.kind == MessageKind::Command {
                    let error = Error::Lifecycle(format!("{} is not a control command", other.name()));
                    let _ = channel.respond(&message, Target::Core, Payload::Failed { error: error.to_remote() });
                } else {
                    debug!("Ignoring {} on {}", other.name(), channel.label());
                }
            }
        }
    }
}

/// Slot health transitions: a terminated slot orphans its workers, a
/// recovered one gets its lost workers' reservations reconciled.
async fn supervise(events: flume::Receiver<SlotEvent>, dispatcher: Arc<Dispatcher>) {
    while let Ok(event) = events.recv_async().await {
        match event {
            SlotEvent::Terminated { slot, reason } => {
                let lost = dispatcher.on_slot_terminated(slot, &reason);
                if !lost.is_empty() {
                    warn!("{} workers lost with {}", lost.len(), slot);
                }
            }
            SlotEvent::Degraded { slot } => debug!("{} degraded", slot),
            SlotEvent::Recovered { slot } => {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    if let Err(e) = dispatcher.reconcile(slot).await {
                        warn!("Reconciling {} after recovery failed: {}", slot, e);
                    }
                });
            }
        }
    }
}

async fn probe_degraded(slots: Arc<ProcessSlotManager>, probe_timeout: Duration, degraded_timeout: Duration) {
    let mut interval = tokio::time::interval(PROBE_PERIOD);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        slots.check_degraded(probe_timeout, degraded_timeout).await;
    }
}
