use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{EnvFilter, fmt};

use aleph_orchestrator::core::NodeId;
use aleph_orchestrator::gateway::NodeAgent;
use aleph_orchestrator::slots::{SlotEnv, run_slot_process};
use aleph_orchestrator::{Catalog, Engine, EngineConfig};

const USAGE: &str = "usage:
  aleph-orchestrator run [config.toml]
  aleph-orchestrator node <gateway-addr> <node-id> <capacity> [root-dir]
  aleph-orchestrator gen-config [path]";

const FORCE_AFTER: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // 1. Initialize logger
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,aleph_orchestrator=debug"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    // 2. Slot processes are this binary, started with ALEPH_SLOT_* set
    if let Some(slot_env) = SlotEnv::from_env()? {
        tracing::debug!("Starting as {} host", slot_env.slot);
        run_slot_process(Catalog::builtin()?, slot_env).await?;
        return Ok(());
    }

    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("run") | None => run(args.get(2).map(PathBuf::from)).await,
        Some("node") => {
            let (Some(addr), Some(id), Some(capacity)) = (args.get(2), args.get(3), args.get(4)) else {
                anyhow::bail!("{USAGE}");
            };
            let capacity: usize = capacity.parse()?;
            let root = args.get(5).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("aleph-node"));
            node(addr, NodeId::new(id.as_str()), capacity, root).await
        }
        Some("gen-config") => {
            let path = args.get(2).map(String::as_str).unwrap_or("aleph.toml");
            gen_config(Path::new(path))
        }
        Some(other) => anyhow::bail!("unknown command {other}\n{USAGE}"),
    }
}

async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    tracing::info!("🦀 AlephTX Orchestrator starting...");

    let mut config = match config_path {
        Some(path) => EngineConfig::load(&path)?,
        None => EngineConfig::load_default(),
    };
    config.apply_env();
    let workers = config.workers.clone();

    let engine = Engine::new(config, Catalog::builtin()?);
    engine.start().await?;

    for spec in workers {
        let strategy = spec.strategy.clone();
        match engine.create_worker(spec).await {
            Ok(id) => tracing::info!("Worker {} ({}) created", id, strategy),
            Err(e) => tracing::error!("Worker {} not created: {}", strategy, e),
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl-C received, shutting down");
    engine.shutdown(FORCE_AFTER).await?;
    Ok(())
}

async fn node(addr: &str, id: NodeId, capacity: usize, root: PathBuf) -> anyhow::Result<()> {
    let token = env::var("ALEPH_GATEWAY_TOKEN").unwrap_or_default();
    let config = EngineConfig::load_default();
    std::fs::create_dir_all(root.join("components"))?;

    let agent = NodeAgent::new(id, capacity, token, Arc::new(Catalog::builtin()?), root)
        .with_heartbeat(config.gateway.heartbeat());
    let session = agent.connect(addr).await?;

    tokio::select! {
        _ = session.closed() => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("Ctrl-C received, leaving"),
    }
    session.shutdown().await;
    Ok(())
}

fn gen_config(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    std::fs::write(path, EngineConfig::template())?;
    println!("📝 Wrote {}", path.display());
    Ok(())
}
