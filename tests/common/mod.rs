#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use aleph_orchestrator::core::config::IpcMode;
use aleph_orchestrator::core::{ProcessSlot, SlotId, WorkerId, WorkerSpec, WorkerState};
use aleph_orchestrator::{Catalog, Engine, EngineConfig};

pub fn temp_root(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("aleph-it-{tag}-{}", uuid::Uuid::new_v4()))
}

/// In-process slots, `slots` x `per_slot`, failing fast when full.
pub fn config(tag: &str, slots: usize, per_slot: usize) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.engine.local_slots = slots;
    config.engine.workers_per_slot = per_slot;
    config.engine.ack_timeout_ms = 2_000;
    config.engine.stop_timeout_ms = 2_000;
    config.engine.root_dir = temp_root(tag);
    config.ipc.mode = IpcMode::InProcess;
    config
}

pub async fn started(config: EngineConfig, catalog: Catalog) -> Engine {
    let engine = Engine::new(config, catalog);
    engine.start().await.unwrap();
    engine
}

/// A debug worker that stays idle for the duration of a test.
pub fn idle_worker() -> WorkerSpec {
    WorkerSpec::new("debug")
        .with_config("tick_ms", 60_000)
        .with_config("report", false)
}

/// A debug worker that ticks `ticks` times and then stops itself.
pub fn short_worker(ticks: u64) -> WorkerSpec {
    WorkerSpec::new("debug")
        .with_config("tick_ms", 20)
        .with_config("max_ticks", ticks)
}

/// Poll until the worker reaches `state` or `within` elapses.
pub async fn wait_for_state(engine: &Engine, id: WorkerId, state: WorkerState, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if engine.worker_status(id).map(|w| w.state == state).unwrap_or(false) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Poll until `slot` satisfies `check` or `within` elapses.
pub async fn wait_for_slot(
    engine: &Engine,
    slot: SlotId,
    check: impl Fn(&ProcessSlot) -> bool,
    within: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        let matched = engine
            .slots()
            .map(|slots| slots.iter().any(|s| s.id == slot && check(s)))
            .unwrap_or(false);
        if matched {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

pub async fn teardown(engine: Engine) {
    let root = engine.config().engine.root_dir.clone();
    let _ = engine.shutdown(Duration::from_secs(2)).await;
    let _ = std::fs::remove_dir_all(root);
}
