//! Slot launchers - how a local slot's host gets started
//!
//! `ProcessLauncher` re-executes the orchestrator binary as a child process
//! that connects back over loopback TCP and authenticates with the engine's
//! key. `InProcessLauncher` runs the host on a task over an in-memory pipe.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::host::SlotHost;
use crate::catalog::Catalog;
use crate::core::{Error, Result, SlotId};
use crate::ipc::{Admission, BoxStream, Hello, digest, read_handshake, write_frame};

pub const ENV_SLOT_ID: &str = "ALEPH_SLOT_ID";
pub const ENV_IPC_ADDR: &str = "ALEPH_IPC_ADDR";
pub const ENV_AUTH_KEY: &str = "ALEPH_AUTH_KEY";
pub const ENV_ROOT_DIR: &str = "ALEPH_ROOT_DIR";
pub const ENV_SLOT_CAPACITY: &str = "ALEPH_SLOT_CAPACITY";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// What keeps a local slot's host alive
pub enum SlotProcess {
    Child(tokio::process::Child),
    Task(JoinHandle<Result<()>>),
}

impl SlotProcess {
    pub fn pid(&self) -> Option<u32> {
        match self {
            SlotProcess::Child(child) => child.id(),
            SlotProcess::Task(_) => None,
        }
    }

    /// Hard stop. Children are reaped in the background.
    pub fn kill(self) {
        match self {
            SlotProcess::Child(mut child) => {
                let _ = child.start_kill();
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
            }
            SlotProcess::Task(task) => task.abort(),
        }
    }

    /// Give the host a chance to exit on its own, then kill it.
    pub async fn reap(self, grace: Duration) {
        match self {
            SlotProcess::Child(mut child) => {
                if tokio::time::timeout(grace, child.wait()).await.is_err() {
                    SlotProcess::Child(child).kill();
                }
            }
            SlotProcess::Task(mut task) => {
                if tokio::time::timeout(grace, &mut task).await.is_err() {
                    task.abort();
                }
            }
        }
    }
}

/// A started slot host, connected
pub struct LaunchedSlot {
    pub stream: BoxStream,
    pub process: SlotProcess,
}

#[async_trait]
pub trait SlotLauncher: Send + Sync {
    async fn launch(&self, slot: SlotId, capacity: usize) -> Result<LaunchedSlot>;
}

/// Loopback listener slot processes connect back to.
pub struct LocalAcceptor {
    addr: SocketAddr,
    waiting: Arc<Mutex<HashMap<SlotId, oneshot::Sender<TcpStream>>>>,
    task: JoinHandle<()>,
}

impl LocalAcceptor {
    pub async fn bind(listen: &str, auth_key: &str) -> Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        let addr = listener.local_addr()?;
        let waiting: Arc<Mutex<HashMap<SlotId, oneshot::Sender<TcpStream>>>> = Arc::default();
        let expected = digest(auth_key);
        info!("🔌 Slot IPC listening on {}", addr);

        let task = {
            let waiting = waiting.clone();
            tokio::spawn(async move {
                loop {
                    let (stream, peer) = match listener.accept().await {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("Slot IPC accept failed: {}", e);
                            continue;
                        }
                    };
                    let waiting = waiting.clone();
                    let expected = expected.clone();
                    tokio::spawn(async move {
                        if let Err(e) = admit(stream, &expected, &waiting).await {
                            warn!("Refused slot connection from {}: {}", peer, e);
                        }
                    });
                }
            })
        };

        Ok(Self { addr, waiting, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Resolves with the stream once `slot` has connected and authenticated.
    pub fn expect(&self, slot: SlotId) -> oneshot::Receiver<TcpStream> {
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(slot, tx);
        rx
    }

    pub fn forget(&self, slot: SlotId) {
        self.waiting.lock().remove(&slot);
    }
}

impl Drop for LocalAcceptor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn admit(
    mut stream: TcpStream,
    expected: &str,
    waiting: &Mutex<HashMap<SlotId, oneshot::Sender<TcpStream>>>,
) -> Result<()> {
    let hello: Hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut stream))
        .await
        .map_err(|_| Error::timeout("slot handshake", HANDSHAKE_TIMEOUT))??;

    let (slot, key, pid) = match hello {
        Hello::Slot { slot, auth_key, pid } => (slot, auth_key, pid),
        Hello::Join(_) => {
            write_frame(&mut stream, &Admission::reject("not a gateway")).await?;
            return Err(Error::Auth("join request on the slot listener".into()));
        }
    };

    if digest(&key) != expected {
        write_frame(&mut stream, &Admission::reject("invalid auth key")).await?;
        return Err(Error::Auth(format!("{slot} (pid {pid}) presented a wrong key")));
    }

    let Some(tx) = waiting.lock().remove(&slot) else {
        write_frame(&mut stream, &Admission::reject("unexpected slot")).await?;
        return Err(Error::Auth(format!("{slot} was not being launched")));
    };

    write_frame(&mut stream, &Admission::accept(vec![slot], 0)).await?;
    debug!("{} connected from pid {}", slot, pid);
    tx.send(stream)
        .map_err(|_| Error::Transport(format!("{slot} launch was abandoned")))
}

/// Starts each slot as a child process of the control process.
pub struct ProcessLauncher {
    binary: PathBuf,
    acceptor: Arc<LocalAcceptor>,
    auth_key: String,
    root_dir: PathBuf,
    launch_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(
        binary: PathBuf,
        acceptor: Arc<LocalAcceptor>,
        auth_key: String,
        root_dir: PathBuf,
        launch_timeout: Duration,
    ) -> Self {
        Self {
            binary,
            acceptor,
            auth_key,
            root_dir,
            launch_timeout,
        }
    }
}

#[async_trait]
impl SlotLauncher for ProcessLauncher {
    async fn launch(&self, slot: SlotId, capacity: usize) -> Result<LaunchedSlot> {
        let connected = self.acceptor.expect(slot);

        let mut child = tokio::process::Command::new(&self.binary)
            .env(ENV_SLOT_ID, slot.0.to_string())
            .env(ENV_IPC_ADDR, self.acceptor.addr().to_string())
            .env(ENV_AUTH_KEY, &self.auth_key)
            .env(ENV_ROOT_DIR, &self.root_dir)
            .env(ENV_SLOT_CAPACITY, capacity.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                self.acceptor.forget(slot);
                Error::Transport(format!("failed to spawn {}: {e}", self.binary.display()))
            })?;
        debug!("{} spawned as pid {:?}", slot, child.id());

        let outcome = tokio::select! {
            stream = connected => stream.map_err(|_| Error::Transport(format!("{slot} never connected"))),
            status = child.wait() => Err(Error::Transport(format!("{slot} exited during launch: {status:?}"))),
            _ = tokio::time::sleep(self.launch_timeout) => Err(Error::timeout(format!("{slot} launch"), self.launch_timeout)),
        };

        match outcome {
            Ok(stream) => Ok(LaunchedSlot {
                stream: Box::new(stream),
                process: SlotProcess::Child(child),
            }),
            Err(e) => {
                self.acceptor.forget(slot);
                SlotProcess::Child(child).kill();
                Err(e)
            }
        }
    }
}

/// Hosts each slot on a task of the current runtime.
pub struct InProcessLauncher {
    catalog: Arc<Catalog>,
    root_dir: PathBuf,
}

impl InProcessLauncher {
    pub fn new(catalog: Arc<Catalog>, root_dir: PathBuf) -> Self {
        Self { catalog, root_dir }
    }
}

#[async_trait]
impl SlotLauncher for InProcessLauncher {
    async fn launch(&self, slot: SlotId, capacity: usize) -> Result<LaunchedSlot> {
        let (control_end, host_end) = tokio::io::duplex(1 << 20);
        let host = SlotHost::new(slot, capacity, self.catalog.clone(), self.root_dir.clone());
        let task = tokio::spawn(host.serve(host_end));
        Ok(LaunchedSlot {
            stream: Box::new(control_end),
            process: SlotProcess::Task(task),
        })
    }
}

/// Settings a slot process reads from its environment
#[derive(Debug, Clone)]
pub struct SlotEnv {
    pub slot: SlotId,
    pub ipc_addr: String,
    pub auth_key: String,
    pub root_dir: PathBuf,
    pub capacity: usize,
}

impl SlotEnv {
    /// `None` unless this process was launched as a slot host.
    pub fn from_env() -> Result<Option<Self>> {
        let Ok(slot) = std::env::var(ENV_SLOT_ID) else {
            return Ok(None);
        };
        let var = |name: &str| std::env::var(name).map_err(|_| Error::Config(format!("{name} not set")));

        let slot = slot
            .parse::<u32>()
            .map_err(|e| Error::Config(format!("{ENV_SLOT_ID}: {e}")))?;
        let capacity = var(ENV_SLOT_CAPACITY)?
            .parse::<usize>()
            .map_err(|e| Error::Config(format!("{ENV_SLOT_CAPACITY}: {e}")))?;

        Ok(Some(Self {
            slot: SlotId(slot),
            ipc_addr: var(ENV_IPC_ADDR)?,
            auth_key: var(ENV_AUTH_KEY)?,
            root_dir: PathBuf::from(var(ENV_ROOT_DIR)?),
            capacity,
        }))
    }
}

/// Entry point of a slot child process: pin, connect back, authenticate,
/// then host workers until the control process says otherwise.
pub async fn run_slot_process(catalog: Catalog, env: SlotEnv) -> Result<()> {
    if let Some(cores) = core_affinity::get_core_ids()
        && !cores.is_empty()
    {
        let core = cores[env.slot.0 as usize % cores.len()];
        if core_affinity::set_for_current(core) {
            debug!("{} pinned to core {}", env.slot, core.id);
        }
    }

    let mut stream = TcpStream::connect(&env.ipc_addr).await?;
    write_frame(
        &mut stream,
        &Hello::Slot {
            slot: env.slot,
            auth_key: env.auth_key.clone(),
            pid: std::process::id(),
        },
    )
    .await?;

    let admission: Admission = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut stream))
        .await
        .map_err(|_| Error::timeout("slot admission", HANDSHAKE_TIMEOUT))??;
    if !admission.accepted {
        return Err(Error::Auth(admission.reason.unwrap_or_else(|| "rejected".into())));
    }

    let host = SlotHost::new(env.slot, env.capacity, Arc::new(catalog), env.root_dir);
    host.serve(stream).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wrong_key_refused() {
        let acceptor = LocalAcceptor::bind("127.0.0.1:0", "right").await.unwrap();
        let _pending = acceptor.expect(SlotId(0));

        let mut stream = TcpStream::connect(acceptor.addr()).await.unwrap();
        write_frame(
            &mut stream,
            &Hello::Slot {
                slot: SlotId(0),
                auth_key: "wrong".into(),
                pid: 1,
            },
        )
        .await
        .unwrap();
        let admission: Admission = read_handshake(&mut stream).await.unwrap();
        assert!(!admission.accepted);
        assert_eq!(admission.reason.as_deref(), Some("invalid auth key"));
    }

    #[tokio::test]
    async fn test_right_key_hands_over_stream() {
        let acceptor = LocalAcceptor::bind("127.0.0.1:0", "right").await.unwrap();
        let connected = acceptor.expect(SlotId(3));

        let mut stream = TcpStream::connect(acceptor.addr()).await.unwrap();
        write_frame(
            &mut stream,
            &Hello::Slot {
                slot: SlotId(3),
                auth_key: "right".into(),
                pid: 1,
            },
        )
        .await
        .unwrap();
        let admission: Admission = read_handshake(&mut stream).await.unwrap();
        assert!(admission.accepted);
        assert!(connected.await.is_ok());
    }
}
