//! Slot host - the worker-hosting side of a slot channel
//!
//! Runs inside a slot process (or a task, or a remote node) and executes the
//! control process's commands: build workers, drive them, stop them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::context::WorkerContext;
use crate::catalog::Catalog;
use crate::core::{ComponentHandle, ConfigMap, Error, Result, SlotId, Strategy, WorkerEvent, WorkerId, WorkerSpec};
use crate::ipc::{AsyncStream, Channel, Inbound, Message, MessageKind, Payload, Target};

/// Bound on worker -> core calls
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

enum WorkerCommand {
    Deliver { topic: String, data: Value },
    Stop(oneshot::Sender<()>),
}

struct WorkerHandle {
    control: flume::Sender<WorkerCommand>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct HostState {
    workers: HashMap<WorkerId, WorkerHandle>,
    /// Accepted but not built yet
    creating: HashSet<WorkerId>,
    /// Aborted while still being built
    aborted: HashSet<WorkerId>,
}

/// Hosts up to `capacity` workers for one slot.
pub struct SlotHost {
    slot: SlotId,
    capacity: usize,
    catalog: Arc<Catalog>,
    root_dir: PathBuf,
    call_timeout: Duration,
    state: Arc<Mutex<HostState>>,
    shutdown: Notify,
}

impl SlotHost {
    pub fn new(slot: SlotId, capacity: usize, catalog: Arc<Catalog>, root_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            slot,
            capacity,
            catalog,
            root_dir,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            state: Arc::new(Mutex::new(HostState::default())),
            shutdown: Notify::new(),
        })
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Running workers
    pub fn load(&self) -> usize {
        self.state.lock().workers.len()
    }

    /// Ids of the workers currently running here
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.state.lock().workers.keys().copied().collect()
    }

    /// Serve commands from the control process until told to shut down or
    /// until the stream closes. Every worker is stopped before returning.
    pub async fn serve<S: AsyncStream>(self: Arc<Self>, stream: S) -> Result<()> {
        let (tx, rx) = flume::unbounded();
        let channel = Channel::spawn(format!("{}-host", self.slot), stream, tx);
        info!("🧵 {} hosting up to {} workers", self.slot, self.capacity);

        loop {
            tokio::select! {
                inbound = rx.recv_async() => {
                    let Ok(Inbound { channel, message }) = inbound else { break };
                    self.clone().dispatch(channel, message);
                }
                _ = self.shutdown.notified() => break,
                _ = channel.closed() => {
                    warn!("{} lost its control channel: {:?}", self.slot, channel.closed_reason());
                    break;
                }
            }
        }

        self.stop_all().await;
        channel.close("host exiting");
        Ok(())
    }

    /// Handle one message arriving for this slot. Long-running work is
    /// spawned so other commands on the channel are not held up.
    pub fn dispatch(self: Arc<Self>, channel: Channel, message: Message) {
        match message.payload.clone() {
            Payload::CreateWorker { worker, spec, settings } => {
                tokio::spawn(async move {
                    match self.create_worker(worker, spec, settings, &channel).await {
                        Ok((components, announced)) => {
                            let reply = Payload::Created { worker, components };
                            let _ = channel.respond(&message, Target::Slot(self.slot), reply);
                            // an early exit is only reported once Created is queued
                            let _ = announced.send(());
                        }
                        Err(e) => {
                            warn!("{} failed to create worker {}: {}", self.slot, worker, e);
                            let reply = Payload::Failed { error: e.to_remote() };
                            let _ = channel.respond(&message, Target::Slot(self.slot), reply);
                        }
                    }
                });
            }
            Payload::StopWorker { worker } => {
                tokio::spawn(async move {
                    let reply = match self.stop_worker(worker).await {
                        Ok(()) => Payload::ack(),
                        Err(e) => Payload::Failed { error: e.to_remote() },
                    };
                    let _ = channel.respond(&message, Target::Slot(self.slot), reply);
                });
            }
            Payload::AbortWorker { worker } => {
                tokio::spawn(async move {
                    self.abort_worker(worker).await;
                });
            }
            Payload::Deliver { worker, topic, data } => {
                let control = self.state.lock().workers.get(&worker).map(|h| h.control.clone());
                match control {
                    Some(control) => {
                        let _ = control.send(WorkerCommand::Deliver { topic, data });
                    }
                    None => debug!("{} dropping delivery for unknown worker {}", self.slot, worker),
                }
            }
            Payload::Ping => {
                let data = json!({
                    "workers": self.worker_ids(),
                    "load": self.load(),
                    "capacity": self.capacity,
                });
                let _ = channel.respond(&message, Target::Slot(self.slot), Payload::Ack { data });
            }
            Payload::Shutdown => {
                tokio::spawn(async move {
                    info!("{} shutting down", self.slot);
                    self.stop_all().await;
                    let _ = channel.respond(&message, Target::Slot(self.slot), Payload::ack());
                    let _ = channel.flush().await;
                    self.shutdown.notify_one();
                });
            }
            other => {
                if message.kind == MessageKind::Command {
                    let error = Error::Lifecycle(format!("{} is not a slot command", other.name()));
                    let _ = channel.respond(
                        &message,
                        Target::Slot(self.slot),
                        Payload::Failed { error: error.to_remote() },
                    );
                } else {
                    debug!("{} ignoring {} event", self.slot, other.name());
                }
            }
        }
    }

    async fn create_worker(
        &self,
        worker: WorkerId,
        spec: WorkerSpec,
        settings: BTreeMap<String, ConfigMap>,
        channel: &Channel,
    ) -> Result<(Vec<ComponentHandle>, oneshot::Sender<()>)> {
        {
            let mut state = self.state.lock();
            if state.workers.contains_key(&worker) || state.creating.contains(&worker) {
                return Err(Error::WorkerCreation(format!("worker {worker} already exists")));
            }
            if state.workers.len() + state.creating.len() >= self.capacity {
                return Err(Error::Placement(format!("{} is full", self.slot)));
            }
            state.creating.insert(worker);
        }

        let built = self.build_worker(worker, &spec, &settings, channel).await;

        let mut state = self.state.lock();
        state.creating.remove(&worker);
        let aborted = state.aborted.remove(&worker);
        let (strategy, ctx) = built?;
        let (announced, announced_rx) = oneshot::channel();

        if aborted {
            drop(state);
            info!("{} discarding aborted worker {}", self.slot, worker);
            let components = ctx.handles();
            tokio::spawn(async move {
                let mut strategy = strategy;
                finish(&mut strategy, &ctx).await;
            });
            return Ok((components, announced));
        }

        let components = ctx.handles();
        let (control_tx, control_rx) = flume::unbounded();
        let task = tokio::spawn(run_worker(
            strategy,
            ctx,
            control_rx,
            announced_rx,
            self.state.clone(),
            channel.clone(),
        ));
        state.workers.insert(
            worker,
            WorkerHandle {
                control: control_tx,
                task,
            },
        );
        info!("▶️ {} started worker {} ({})", self.slot, worker, spec.strategy);
        Ok((components, announced))
    }

    /// Bind components, construct the strategy and initialize it. Anything
    /// already opened is closed again on failure.
    async fn build_worker(
        &self,
        worker: WorkerId,
        spec: &WorkerSpec,
        settings: &BTreeMap<String, ConfigMap>,
        channel: &Channel,
    ) -> Result<(Box<dyn Strategy>, WorkerContext)> {
        if !self.catalog.strategies.contains(&spec.strategy) {
            return Err(Error::UnknownStrategy(spec.strategy.clone()));
        }

        let components = Arc::new(
            self.catalog
                .components
                .bind_strategy_components(worker, spec, settings, &self.root_dir)
                .await?,
        );

        let mut strategy = match self.catalog.strategies.build(&spec.strategy, &spec.config) {
            Ok(s) => s,
            Err(e) => {
                components.close_all().await;
                return Err(e);
            }
        };

        let ctx = WorkerContext::new(
            worker,
            spec.strategy.clone(),
            self.slot,
            components.clone(),
            channel.clone(),
            self.call_timeout,
        );

        if let Err(e) = strategy.initialize(&ctx).await {
            components.close_all().await;
            return Err(Error::WorkerCreation(format!("{} initialize: {e}", spec.strategy)));
        }
        Ok((strategy, ctx))
    }

    async fn stop_worker(&self, worker: WorkerId) -> Result<()> {
        let handle = self.state.lock().workers.remove(&worker);
        let Some(handle) = handle else {
            return Err(Error::UnknownWorker(worker.to_string()));
        };
        stop_handle(handle).await;
        info!("⏹️ {} stopped worker {}", self.slot, worker);
        Ok(())
    }

    async fn abort_worker(&self, worker: WorkerId) {
        let handle = {
            let mut state = self.state.lock();
            if state.creating.contains(&worker) {
                state.aborted.insert(worker);
                None
            } else {
                state.workers.remove(&worker)
            }
        };
        if let Some(handle) = handle {
            info!("{} aborting worker {}", self.slot, worker);
            stop_handle(handle).await;
        }
    }

    /// Stop every worker concurrently.
    pub async fn stop_all(&self) {
        let handles: Vec<_> = self.state.lock().workers.drain().map(|(_, h)| h).collect();
        if handles.is_empty() {
            return;
        }
        info!("{} stopping {} workers", self.slot, handles.len());
        futures::future::join_all(handles.into_iter().map(stop_handle)).await;
    }
}

impl Drop for SlotHost {
    fn drop(&mut self) {
        // a host torn down without Shutdown takes its workers with it
        for (_, handle) in self.state.lock().workers.drain() {
            handle.task.abort();
        }
    }
}

async fn stop_handle(handle: WorkerHandle) {
    let (done_tx, done_rx) = oneshot::channel();
    if handle.control.send(WorkerCommand::Stop(done_tx)).is_err() {
        // already on its way out
        let _ = handle.task.await;
        return;
    }
    let _ = done_rx.await;
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

enum Exit {
    /// Stopped by the control process
    Stopped(Option<oneshot::Sender<()>>),
    /// Ended on its own
    SelfExit(String),
}

async fn run_worker(
    mut strategy: Box<dyn Strategy>,
    ctx: WorkerContext,
    control: flume::Receiver<WorkerCommand>,
    announced: oneshot::Receiver<()>,
    state: Arc<Mutex<HostState>>,
    channel: Channel,
) {
    let mut ticker = strategy.tick_interval().map(|period| {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });
    let stop = ctx.stop_signal();

    let exit = loop {
        if stop.is_requested() {
            break Exit::SelfExit("stop requested by strategy".into());
        }
        let event = tokio::select! {
            cmd = control.recv_async() => match cmd {
                Ok(WorkerCommand::Deliver { topic, data }) => WorkerEvent::Message { topic, data },
                Ok(WorkerCommand::Stop(done)) => break Exit::Stopped(Some(done)),
                Err(_) => break Exit::Stopped(None),
            },
            _ = next_tick(&mut ticker) => WorkerEvent::Tick,
            _ = stop.wait() => continue,
        };
        if let Err(e) = strategy.on_event(&ctx, event).await {
            warn!("Worker {} failed: {}", ctx.id(), e);
            break Exit::SelfExit(format!("strategy error: {e}"));
        }
    };

    match exit {
        Exit::Stopped(done) => {
            finish(&mut strategy, &ctx).await;
            if let Some(done) = done {
                let _ = done.send(());
            }
        }
        Exit::SelfExit(reason) => {
            // Otherwise a concurrent stop owns the handle and answers for us
            let owned = state.lock().workers.remove(&ctx.id()).is_some();
            finish(&mut strategy, &ctx).await;
            if owned {
                info!("Worker {} exited: {}", ctx.id(), reason);
                // dropped sender means creation was never answered either way
                let _ = announced.await;
                let _ = channel.notify(
                    Target::Core,
                    Payload::WorkerExited {
                        worker: ctx.id(),
                        reason,
                    },
                );
            }
        }
    }
}

/// Strategy shutdown, then component close.
async fn finish(strategy: &mut Box<dyn Strategy>, ctx: &WorkerContext) {
    if let Err(e) = strategy.shutdown(ctx).await {
        warn!("Worker {} shutdown failed: {}", ctx.id(), e);
    }
    ctx.close_components().await;
}
