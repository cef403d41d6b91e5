mod common;

use std::time::Duration;

use aleph_orchestrator::core::config::IpcMode;
use aleph_orchestrator::core::{SlotLocation, WorkerState};
use aleph_orchestrator::{Catalog, Engine};

use common::*;

/// Local slots as child processes of the crate's own binary.
fn process_config(tag: &str, slots: usize, per_slot: usize) -> aleph_orchestrator::EngineConfig {
    let mut config = config(tag, slots, per_slot);
    config.ipc.mode = IpcMode::Process;
    config.ipc.listen = "127.0.0.1:0".into();
    config.ipc.host_binary = Some(env!("CARGO_BIN_EXE_aleph-orchestrator").into());
    config.engine.ack_timeout_ms = 5_000;
    config
}

#[tokio::test]
async fn local_slots_run_as_child_processes() {
    let engine = Engine::new(process_config("proc", 2, 2), Catalog::builtin().unwrap());
    engine.start().await.unwrap();

    let mut pids: Vec<u32> = engine
        .slots()
        .unwrap()
        .iter()
        .filter_map(|s| match s.location {
            SlotLocation::Local { pid } => pid,
            SlotLocation::Remote { .. } => None,
        })
        .collect();
    pids.sort_unstable();
    pids.dedup();
    assert_eq!(pids.len(), 2);
    assert!(!pids.contains(&std::process::id()));

    // ends on its own inside the child
    let short = engine.create_worker(short_worker(3)).await.unwrap();
    assert!(wait_for_state(&engine, short, WorkerState::Stopped, Duration::from_secs(5)).await);

    let idle = engine.create_worker(idle_worker()).await.unwrap();
    assert_eq!(engine.worker_status(idle).unwrap().state, WorkerState::Running);
    engine.stop_worker(idle).await.unwrap();
    assert_eq!(engine.worker_status(idle).unwrap().state, WorkerState::Stopped);

    let load: usize = engine.slots().unwrap().iter().map(|s| s.load).sum();
    assert_eq!(load, 0);

    teardown(engine).await;
}
