mod common;

use std::sync::Arc;
use std::time::Duration;

use aleph_orchestrator::components::builtin::EventLog;
use aleph_orchestrator::core::{Error, NodeId, SlotState, WorkerState};
use aleph_orchestrator::gateway::NodeAgent;
use aleph_orchestrator::{Catalog, Engine, EngineConfig};

use common::*;

const TOKEN: &str = "node-secret";

/// One local slot of one worker, plus a gateway with a 50ms period.
fn gateway_config(tag: &str) -> EngineConfig {
    let mut config = config(tag, 1, 1);
    config.gateway.enabled = true;
    config.gateway.listen = "127.0.0.1:0".into();
    config.gateway.token = TOKEN.into();
    config.gateway.heartbeat_ms = 50;
    config.gateway.missed_heartbeats = 3;
    config.gateway.silence_window_ms = 500;
    config
}

fn agent(id: &str, token: &str, heartbeat: Duration) -> NodeAgent {
    NodeAgent::new(
        NodeId::new(id),
        1,
        token,
        Arc::new(Catalog::builtin().unwrap()),
        temp_root("node"),
    )
    .with_heartbeat(heartbeat)
}

async fn wait_for_remote_slots(engine: &Engine, state: SlotState, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        let slots = engine.slots().unwrap();
        let remote: Vec<_> = slots.iter().filter(|s| !s.location.is_local()).collect();
        if !remote.is_empty() && remote.iter().all(|s| s.state == state) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn wrong_token_is_refused() {
    let engine = started(gateway_config("badtoken"), Catalog::builtin().unwrap()).await;
    let addr = engine.gateway_addr().unwrap().to_string();

    let joined = agent("intruder", "guess", Duration::from_millis(50)).connect(&addr).await;
    assert!(matches!(joined, Err(Error::Auth(_))));
    assert!(engine.status().unwrap().nodes.is_empty());

    teardown(engine).await;
}

#[tokio::test]
async fn remote_slot_runs_workers_while_heartbeating() {
    let engine = started(gateway_config("healthy"), Catalog::builtin().unwrap()).await;
    let addr = engine.gateway_addr().unwrap().to_string();

    let session = agent("n1", TOKEN, Duration::from_millis(50)).connect(&addr).await.unwrap();
    assert_eq!(session.slots().len(), 1);
    assert!(wait_for_remote_slots(&engine, SlotState::Ready, Duration::from_secs(2)).await);

    // local slot first (lowest id), then the remote one
    let local = engine.create_worker(idle_worker()).await.unwrap();
    let remote = engine.create_worker(short_worker(3)).await.unwrap();
    assert!(engine.worker_status(local).unwrap().slot != engine.worker_status(remote).unwrap().slot);

    // worker-to-core events travel through the gateway
    assert!(wait_for_state(&engine, remote, WorkerState::Stopped, Duration::from_secs(3)).await);
    let log = engine.core_component::<EventLog>("event_log").unwrap();
    assert!(log.count("tick") >= 3);

    // well past the silence window, heartbeats keep it alive
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(wait_for_remote_slots(&engine, SlotState::Ready, Duration::from_millis(100)).await);
    assert_eq!(engine.status().unwrap().nodes.len(), 1);

    session.shutdown().await;
    teardown(engine).await;
}

#[tokio::test]
async fn silent_node_degrades_then_loses_workers() {
    let mut config = gateway_config("silent");
    config.gateway.heartbeat_ms = 100;
    config.gateway.silence_window_ms = 1_000;
    let engine = started(config, Catalog::builtin().unwrap()).await;
    let addr = engine.gateway_addr().unwrap().to_string();

    // never heartbeats within the test
    let session = agent("n2", TOKEN, Duration::from_secs(3600)).connect(&addr).await.unwrap();
    assert!(wait_for_remote_slots(&engine, SlotState::Ready, Duration::from_secs(2)).await);

    let local = engine.create_worker(idle_worker()).await.unwrap();
    let remote = engine.create_worker(idle_worker()).await.unwrap();

    assert!(wait_for_remote_slots(&engine, SlotState::Degraded, Duration::from_secs(2)).await);
    assert!(wait_for_remote_slots(&engine, SlotState::Terminated, Duration::from_secs(2)).await);
    assert!(wait_for_state(&engine, remote, WorkerState::Lost, Duration::from_secs(2)).await);
    assert_eq!(engine.worker_status(local).unwrap().state, WorkerState::Running);
    assert!(engine.status().unwrap().nodes.is_empty());

    drop(session);
    teardown(engine).await;
}

#[tokio::test]
async fn local_only_component_stays_local() {
    let engine = started(gateway_config("localonly"), Catalog::builtin().unwrap()).await;
    let addr = engine.gateway_addr().unwrap().to_string();
    let session = agent("n3", TOKEN, Duration::from_millis(50)).connect(&addr).await.unwrap();
    assert!(wait_for_remote_slots(&engine, SlotState::Ready, Duration::from_secs(2)).await);

    let first = engine
        .create_worker(idle_worker().with_component("persistence"))
        .await
        .unwrap();
    assert!(engine.slots().unwrap().iter().any(|s| s.location.is_local()
        && s.id == engine.worker_status(first).unwrap().slot));

    // the local slot is full; the remote one does not qualify
    assert!(matches!(
        engine.create_worker(idle_worker().with_component("persistence")).await,
        Err(Error::Placement(_))
    ));
    engine.create_worker(idle_worker()).await.unwrap();

    session.shutdown().await;
    teardown(engine).await;
}
