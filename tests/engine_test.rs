mod common;

use std::sync::Arc;
use std::time::Duration;

use aleph_orchestrator::Catalog;
use aleph_orchestrator::components::ComponentDescriptor;
use aleph_orchestrator::components::builtin::EventLog;
use aleph_orchestrator::core::{
    BindContext, ConfigMap, CoreComponent, CoreContext, Error, Result, SlotId, SlotState, Strategy,
    StrategyComponent, WorkerEvent, WorkerId, WorkerSpec, WorkerState,
};
use aleph_orchestrator::ipc::{FrameReader, Message, Payload, Target, write_frame};
use aleph_orchestrator::slots::{LaunchedSlot, SlotLauncher, SlotProcess, WorkerContext};
use async_trait::async_trait;
use serde_json::{Value, json};

use common::*;

/// Takes longer to initialize than the engine waits for an ack.
struct SlowInit;

#[async_trait]
impl Strategy for SlowInit {
    async fn initialize(&mut self, _ctx: &WorkerContext) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(())
    }

    async fn on_event(&mut self, _ctx: &WorkerContext, _event: WorkerEvent) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self, _ctx: &WorkerContext) -> Result<()> {
        Ok(())
    }
}

/// Reads a credential from the `api_keys` core component while starting.
struct KeyReader {
    key: String,
}

#[async_trait]
impl Strategy for KeyReader {
    async fn initialize(&mut self, ctx: &WorkerContext) -> Result<()> {
        let value = ctx.call_core("api_keys", "get", json!({ "key": self.key })).await?;
        if value != json!(["API_KEY_EXAMPLE", "API_SECRET_EXAMPLE"]) {
            return Err(Error::Config(format!("unexpected credentials {value}")));
        }
        Ok(())
    }

    async fn on_event(&mut self, _ctx: &WorkerContext, _event: WorkerEvent) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self, _ctx: &WorkerContext) -> Result<()> {
        Ok(())
    }
}

/// Gives up before its first event.
struct QuitAtOnce;

#[async_trait]
impl Strategy for QuitAtOnce {
    async fn initialize(&mut self, ctx: &WorkerContext) -> Result<()> {
        ctx.request_stop();
        Ok(())
    }

    async fn on_event(&mut self, _ctx: &WorkerContext, _event: WorkerEvent) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self, _ctx: &WorkerContext) -> Result<()> {
        Ok(())
    }
}

/// Needs longer to shut down than the engine waits for a stop.
struct SlowStop;

#[async_trait]
impl Strategy for SlowStop {
    async fn initialize(&mut self, _ctx: &WorkerContext) -> Result<()> {
        Ok(())
    }

    async fn on_event(&mut self, _ctx: &WorkerContext, _event: WorkerEvent) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self, _ctx: &WorkerContext) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(800)).await;
        Ok(())
    }
}

/// Reports to the `sluggish` core component, then stops.
struct ReportAndQuit;

#[async_trait]
impl Strategy for ReportAndQuit {
    async fn initialize(&mut self, ctx: &WorkerContext) -> Result<()> {
        ctx.notify_core("sluggish", "hello", Value::Null)?;
        ctx.request_stop();
        Ok(())
    }

    async fn on_event(&mut self, _ctx: &WorkerContext, _event: WorkerEvent) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self, _ctx: &WorkerContext) -> Result<()> {
        Ok(())
    }
}

/// Takes far too long over every event.
struct Sluggish;

#[async_trait]
impl CoreComponent for Sluggish {
    async fn on_event(&self, _origin: WorkerId, _topic: &str, _data: Value) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

/// Slot host that confirms creations and never answers anything else.
struct MuteLauncher;

#[async_trait]
impl SlotLauncher for MuteLauncher {
    async fn launch(&self, slot: SlotId, _capacity: usize) -> Result<LaunchedSlot> {
        let (control_end, host_end) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(host_end);
            let mut frames = FrameReader::new(read_half);
            while let Some(message) = frames.next().await? {
                if let Payload::CreateWorker { worker, .. } = &message.payload {
                    let created = Payload::Created {
                        worker: *worker,
                        components: vec![],
                    };
                    write_frame(&mut write_half, &Message::response(&message, Target::Slot(slot), created)).await?;
                }
            }
            Ok::<(), Error>(())
        });
        Ok(LaunchedSlot {
            stream: Box::new(control_end),
            process: SlotProcess::Task(task),
        })
    }
}

struct Unreachable;

#[async_trait]
impl StrategyComponent for Unreachable {
    async fn open(&self) -> Result<()> {
        Err(Error::Transport("connection refused".into()))
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

struct BrokenCore;

#[async_trait]
impl CoreComponent for BrokenCore {
    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

fn test_catalog() -> Catalog {
    let mut catalog = Catalog::builtin().unwrap();
    catalog
        .strategies
        .register("slow_init", |_: &ConfigMap| Ok(Box::new(SlowInit) as Box<dyn Strategy>))
        .unwrap();
    catalog
        .strategies
        .register("key_reader", |config: &ConfigMap| {
            let key = config.get("key").and_then(Value::as_str).unwrap_or("JSON_KEY_EXAMPLE");
            Ok(Box::new(KeyReader { key: key.to_string() }) as Box<dyn Strategy>)
        })
        .unwrap();
    catalog
        .strategies
        .register("quit_at_once", |_: &ConfigMap| Ok(Box::new(QuitAtOnce) as Box<dyn Strategy>))
        .unwrap();
    catalog
        .strategies
        .register("slow_stop", |_: &ConfigMap| Ok(Box::new(SlowStop) as Box<dyn Strategy>))
        .unwrap();
    catalog
        .register_component(ComponentDescriptor::strategy("unreachable", |_: &BindContext| {
            Ok(Arc::new(Unreachable) as Arc<dyn StrategyComponent>)
        }))
        .unwrap();
    catalog
}

fn total_load(engine: &aleph_orchestrator::Engine) -> usize {
    engine.slots().unwrap().iter().map(|s| s.load).sum()
}

#[tokio::test]
async fn capacity_four_fifth_fails_fast() {
    let engine = started(config("fast", 1, 4), Catalog::builtin().unwrap()).await;

    let mut ids = vec![];
    for _ in 0..4 {
        ids.push(engine.create_worker(idle_worker()).await.unwrap());
    }
    assert!(matches!(
        engine.create_worker(idle_worker()).await,
        Err(Error::Placement(_))
    ));
    assert_eq!(engine.list_workers().unwrap().len(), 4);
    for id in &ids {
        assert_eq!(engine.worker_status(*id).unwrap().state, WorkerState::Running);
    }

    teardown(engine).await;
}

#[tokio::test]
async fn capacity_four_fifth_waits_for_stop() {
    let mut config = config("wait", 1, 4);
    config.engine.acquire_wait_ms = 5_000;
    let engine = Arc::new(started(config, Catalog::builtin().unwrap()).await);

    let mut ids = vec![];
    for _ in 0..4 {
        ids.push(engine.create_worker(idle_worker()).await.unwrap());
    }

    let fifth = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.create_worker(idle_worker()).await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!fifth.is_finished());

    engine.stop_worker(ids[0]).await.unwrap();
    let admitted = tokio::time::timeout(Duration::from_secs(3), fifth)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(engine.worker_status(admitted).unwrap().state, WorkerState::Running);
    assert_eq!(engine.worker_status(ids[0]).unwrap().state, WorkerState::Stopped);

    if let Ok(engine) = Arc::try_unwrap(engine) {
        teardown(engine).await;
    }
}

#[tokio::test]
async fn failed_creations_leave_no_trace() {
    let mut config = config("atomic", 1, 4);
    config.engine.ack_timeout_ms = 200;
    let engine = started(config, test_catalog()).await;

    assert!(matches!(
        engine.create_worker(WorkerSpec::new("nope")).await,
        Err(Error::UnknownStrategy(_))
    ));
    assert!(matches!(
        engine.create_worker(idle_worker().with_component("nope")).await,
        Err(Error::UnknownComponent(_))
    ));
    assert!(matches!(
        engine.create_worker(idle_worker().with_component("unreachable")).await,
        Err(Error::WorkerCreation(_))
    ));
    assert!(matches!(
        engine.create_worker(WorkerSpec::new("slow_init")).await,
        Err(Error::Timeout { .. })
    ));
    assert!(matches!(
        engine
            .create_worker(WorkerSpec::new("key_reader").with_config("key", "MISSING"))
            .await,
        Err(Error::WorkerCreation(_))
    ));

    assert!(engine.list_workers().unwrap().is_empty());
    assert_eq!(total_load(&engine), 0);

    // the late worker is discarded on the slot and capacity is intact
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    for _ in 0..4 {
        engine.create_worker(idle_worker()).await.unwrap();
    }

    teardown(engine).await;
}

#[tokio::test]
async fn worker_calls_core_component() {
    let engine = started(config("call", 1, 2), test_catalog()).await;
    let id = engine.create_worker(WorkerSpec::new("key_reader")).await.unwrap();
    assert_eq!(engine.worker_status(id).unwrap().state, WorkerState::Running);
    teardown(engine).await;
}

#[tokio::test]
async fn self_exiting_worker_frees_its_slot() {
    let engine = started(config("exit", 1, 1), Catalog::builtin().unwrap()).await;

    let id = engine
        .create_worker(short_worker(3).with_component("debug"))
        .await
        .unwrap();
    assert!(wait_for_state(&engine, id, WorkerState::Stopped, Duration::from_secs(3)).await);
    assert_eq!(total_load(&engine), 0);

    let log = engine.core_component::<EventLog>("event_log").unwrap();
    assert!(log.count("tick") >= 3);

    // room again on the single-worker slot
    engine.create_worker(idle_worker()).await.unwrap();
    teardown(engine).await;
}

#[tokio::test]
async fn deliver_reaches_worker() {
    let engine = started(config("deliver", 1, 1), Catalog::builtin().unwrap()).await;
    let id = engine.create_worker(idle_worker()).await.unwrap();

    engine.deliver(id, "stop", Value::Null).unwrap();
    assert!(wait_for_state(&engine, id, WorkerState::Stopped, Duration::from_secs(3)).await);
    assert!(matches!(engine.deliver(id, "stop", Value::Null), Err(Error::Lifecycle(_))));

    teardown(engine).await;
}

#[tokio::test]
async fn stop_twice_is_lifecycle_error() {
    let engine = started(config("stop", 1, 1), Catalog::builtin().unwrap()).await;
    let id = engine.create_worker(idle_worker()).await.unwrap();

    engine.stop_worker(id).await.unwrap();
    assert!(matches!(engine.stop_worker(id).await, Err(Error::Lifecycle(_))));
    assert!(matches!(
        engine.stop_worker(aleph_orchestrator::core::WorkerId::new()).await,
        Err(Error::UnknownWorker(_))
    ));

    assert_eq!(engine.prune_workers().unwrap(), 1);
    assert!(engine.list_workers().unwrap().is_empty());
    teardown(engine).await;
}

#[tokio::test]
async fn drain_waits_for_workers() {
    let engine = started(config("drain", 2, 2), Catalog::builtin().unwrap()).await;
    let a = engine.create_worker(short_worker(3)).await.unwrap();
    let b = engine.create_worker(short_worker(5)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(3), engine.drain())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(engine.worker_status(a).unwrap().state, WorkerState::Stopped);
    assert_eq!(engine.worker_status(b).unwrap().state, WorkerState::Stopped);
    assert!(matches!(
        engine.create_worker(idle_worker()).await,
        Err(Error::Lifecycle(_))
    ));
    assert!(!engine.status().unwrap().accepting);

    teardown(engine).await;
}

#[tokio::test]
async fn terminated_slot_loses_only_its_workers() {
    let engine = started(config("terminate", 2, 1), Catalog::builtin().unwrap()).await;
    let a = engine.create_worker(idle_worker()).await.unwrap();
    let b = engine.create_worker(idle_worker()).await.unwrap();

    let slot_a = engine.worker_status(a).unwrap().slot;
    engine.terminate_slot(slot_a, "test").unwrap();

    assert_eq!(engine.worker_status(a).unwrap().state, WorkerState::Lost);
    assert_eq!(engine.worker_status(b).unwrap().state, WorkerState::Running);
    let slots = engine.slots().unwrap();
    assert_eq!(
        slots.iter().filter(|s| s.state == SlotState::Terminated).count(),
        1
    );

    // the surviving slot is full, so re-dispatch has nowhere to go
    assert!(matches!(engine.redispatch(a).await, Err(Error::Placement(_))));
    engine.stop_worker(b).await.unwrap();
    let again = engine.redispatch(a).await.unwrap();
    assert!(engine.worker_status(a).is_err());
    assert_eq!(engine.worker_status(again).unwrap().state, WorkerState::Running);
    assert!(matches!(engine.redispatch(again).await, Err(Error::Lifecycle(_))));

    teardown(engine).await;
}

#[tokio::test]
async fn live_local_slots_never_exceed_configured() {
    let engine = started(config("count", 3, 2), Catalog::builtin().unwrap()).await;
    let live = engine
        .slots()
        .unwrap()
        .iter()
        .filter(|s| s.location.is_local() && s.state.is_live())
        .count();
    assert_eq!(live, 3);
    teardown(engine).await;
}

#[tokio::test]
async fn core_component_failure_is_fatal() {
    let mut catalog = Catalog::builtin().unwrap();
    catalog
        .register_component(ComponentDescriptor::core("broken", |_: &CoreContext| {
            Err::<Arc<dyn CoreComponent>, _>(Error::Config("missing endpoint".into()))
        }))
        .unwrap();
    let config = config("fatal", 1, 1);
    let root = config.engine.root_dir.clone();

    let engine = aleph_orchestrator::Engine::new(config, catalog);
    assert!(matches!(engine.start().await, Err(Error::Component(_))));
    assert!(matches!(
        engine.create_worker(idle_worker()).await,
        Err(Error::Lifecycle(_))
    ));
    let _ = std::fs::remove_dir_all(root);
}

#[tokio::test]
async fn duplicate_core_name_keeps_first() {
    let mut catalog = Catalog::builtin().unwrap();
    let again = catalog.register_component(ComponentDescriptor::core("event_log", |_: &CoreContext| {
        Ok(Arc::new(BrokenCore) as Arc<dyn CoreComponent>)
    }));
    assert!(matches!(again, Err(Error::DuplicateName { .. })));

    let engine = started(config("dup", 1, 1), catalog).await;
    assert!(engine.core_component::<EventLog>("event_log").is_some());
    teardown(engine).await;
}

#[tokio::test]
async fn workers_exiting_during_creation_free_their_slot() {
    let engine = started(config("early", 1, 100), test_catalog()).await;

    let mut ids = vec![];
    for _ in 0..50 {
        ids.push(engine.create_worker(WorkerSpec::new("quit_at_once")).await.unwrap());
    }
    for id in &ids {
        assert!(
            wait_for_state(&engine, *id, WorkerState::Stopped, Duration::from_secs(3)).await,
            "worker {id} stuck in {:?}",
            engine.worker_status(*id).map(|w| w.state)
        );
    }
    assert_eq!(total_load(&engine), 0);

    tokio::time::timeout(Duration::from_secs(3), engine.drain())
        .await
        .unwrap()
        .unwrap();
    teardown(engine).await;
}

#[tokio::test]
async fn slow_stop_loses_worker_and_slot_recovers_empty() {
    let mut config = config("slowstop", 1, 1);
    config.engine.stop_timeout_ms = 200;
    let engine = started(config, test_catalog()).await;

    let id = engine.create_worker(WorkerSpec::new("slow_stop")).await.unwrap();
    let slot = engine.worker_status(id).unwrap().slot;

    assert!(matches!(engine.stop_worker(id).await, Err(Error::Timeout { .. })));
    assert_eq!(engine.worker_status(id).unwrap().state, WorkerState::Lost);
    assert!(wait_for_slot(&engine, slot, |s| s.state == SlotState::Degraded, Duration::from_millis(100)).await);

    // the host answers again and no longer runs the lost worker
    assert!(
        wait_for_slot(
            &engine,
            slot,
            |s| s.state == SlotState::Ready && s.load == 0,
            Duration::from_secs(5)
        )
        .await
    );
    assert_eq!(engine.worker_status(id).unwrap().state, WorkerState::Lost);

    let next = engine.create_worker(idle_worker()).await.unwrap();
    assert_eq!(engine.worker_status(next).unwrap().slot, slot);
    teardown(engine).await;
}

#[tokio::test]
async fn silent_slot_is_terminated_after_degraded_timeout() {
    let mut config = config("mute", 1, 2);
    config.engine.stop_timeout_ms = 200;
    config.engine.degraded_timeout_ms = 1_500;
    let engine = aleph_orchestrator::Engine::new(config, Catalog::builtin().unwrap())
        .with_launcher(Arc::new(MuteLauncher));
    engine.start().await.unwrap();

    let id = engine.create_worker(idle_worker()).await.unwrap();
    let slot = engine.worker_status(id).unwrap().slot;

    assert!(matches!(engine.stop_worker(id).await, Err(Error::Timeout { .. })));
    assert_eq!(engine.worker_status(id).unwrap().state, WorkerState::Lost);
    assert!(wait_for_slot(&engine, slot, |s| s.state == SlotState::Degraded, Duration::from_millis(100)).await);

    assert!(wait_for_slot(&engine, slot, |s| s.state == SlotState::Terminated, Duration::from_secs(8)).await);
    assert_eq!(engine.worker_status(id).unwrap().state, WorkerState::Lost);
    assert_eq!(total_load(&engine), 0);
    assert!(matches!(
        engine.create_worker(idle_worker()).await,
        Err(Error::Placement(_))
    ));

    teardown(engine).await;
}

#[tokio::test]
async fn slow_core_component_does_not_stall_exits() {
    let mut catalog = test_catalog();
    catalog
        .strategies
        .register("report_and_quit", |_: &ConfigMap| Ok(Box::new(ReportAndQuit) as Box<dyn Strategy>))
        .unwrap();
    catalog
        .register_component(ComponentDescriptor::core("sluggish", |_: &CoreContext| {
            Ok(Arc::new(Sluggish) as Arc<dyn CoreComponent>)
        }))
        .unwrap();
    let engine = started(config("sluggish", 1, 2), catalog).await;

    let id = engine.create_worker(WorkerSpec::new("report_and_quit")).await.unwrap();
    assert!(wait_for_state(&engine, id, WorkerState::Stopped, Duration::from_secs(4)).await);
    assert_eq!(total_load(&engine), 0);

    teardown(engine).await;
}
