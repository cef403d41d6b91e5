//! Node agent - the remote side of the gateway
//!
//! Joins a control process, then hosts the slots it was given on local tasks
//! and heartbeats every period P.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::core::{Error, NodeId, Result, SlotId};
use crate::ipc::{Admission, AsyncStream, Channel, Hello, Inbound, JoinRequest, MessageKind, Payload, Target, read_handshake, write_frame};
use crate::slots::SlotHost;

const ADMISSION_TIMEOUT: Duration = Duration::from_secs(10);

pub struct NodeAgent {
    node_id: NodeId,
    capacity: usize,
    token: String,
    catalog: Arc<Catalog>,
    root_dir: PathBuf,
    heartbeat: Duration,
}

impl NodeAgent {
    pub fn new(node_id: NodeId, capacity: usize, token: impl Into<String>, catalog: Arc<Catalog>, root_dir: PathBuf) -> Self {
        Self {
            node_id,
            capacity,
            token: token.into(),
            catalog,
            root_dir,
            heartbeat: Duration::from_secs(1),
        }
    }

    /// Heartbeat period P
    pub fn with_heartbeat(mut self, period: Duration) -> Self {
        self.heartbeat = period;
        self
    }

    pub async fn connect(self, gateway: &str) -> Result<NodeSession> {
        let stream = TcpStream::connect(gateway).await?;
        info!("Node {} connecting to {}", self.node_id, gateway);
        self.attach(stream).await
    }

    /// Join over an already open stream.
    pub async fn attach<S: AsyncStream>(self, mut stream: S) -> Result<NodeSession> {
        let hello = Hello::Join(JoinRequest {
            node_id: self.node_id.clone(),
            credentials_token: self.token.clone(),
            capacity: self.capacity,
        });
        write_frame(&mut stream, &hello).await?;

        let admission: Admission = tokio::time::timeout(ADMISSION_TIMEOUT, read_handshake(&mut stream))
            .await
            .map_err(|_| Error::timeout("join admission", ADMISSION_TIMEOUT))??;
        if !admission.accepted {
            return Err(Error::Auth(admission.reason.unwrap_or_else(|| "rejected".into())));
        }
        info!(
            "✅ Node {} admitted: {} slots x {} workers",
            self.node_id,
            admission.slots.len(),
            admission.workers_per_slot
        );

        let hosts: Arc<BTreeMap<SlotId, Arc<SlotHost>>> = Arc::new(
            admission
                .slots
                .iter()
                .map(|&slot| {
                    let host = SlotHost::new(slot, admission.workers_per_slot, self.catalog.clone(), self.root_dir.clone());
                    (slot, host)
                })
                .collect(),
        );

        let (tx, rx) = flume::unbounded();
        let channel = Channel::spawn(format!("gateway-{}", self.node_id), stream, tx);

        let router = {
            let hosts = hosts.clone();
            tokio::spawn(async move {
                while let Ok(Inbound { channel, message }) = rx.recv_async().await {
                    let host = match message.target {
                        Target::Slot(slot) => hosts.get(&slot).cloned(),
                        _ => None,
                    };
                    match host {
                        Some(host) => host.dispatch(channel, message),
                        None if message.kind == MessageKind::Command => {
                            let error = Error::UnknownSlot(format!("{:?}", message.target));
                            let _ = channel.respond(&message, message.target, Payload::Failed { error: error.to_remote() });
                        }
                        None => debug!("Dropping {} for {:?}", message.payload.name(), message.target),
                    }
                }
            })
        };

        let heartbeat = {
            let hosts = hosts.clone();
            let channel = channel.clone();
            let node = self.node_id.clone();
            let period = self.heartbeat;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    interval.tick().await;
                    let current_load = hosts.values().map(|h| h.load()).sum();
                    let beat = Payload::Heartbeat {
                        node: node.clone(),
                        timestamp: Utc::now(),
                        current_load,
                    };
                    if channel.notify(Target::Core, beat).is_err() {
                        break;
                    }
                }
            })
        };

        Ok(NodeSession {
            node_id: self.node_id,
            hosts,
            channel,
            tasks: vec![router, heartbeat],
        })
    }
}

/// A joined node. Dropping it stops heartbeats and routing.
pub struct NodeSession {
    node_id: NodeId,
    hosts: Arc<BTreeMap<SlotId, Arc<SlotHost>>>,
    channel: Channel,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeSession {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn slots(&self) -> Vec<SlotId> {
        self.hosts.keys().copied().collect()
    }

    pub fn load(&self) -> usize {
        self.hosts.values().map(|h| h.load()).sum()
    }

    /// Resolves when the gateway drops the connection.
    pub async fn closed(&self) {
        self.channel.closed().await
    }

    /// Stop every hosted worker and leave.
    pub async fn shutdown(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        futures::future::join_all(self.hosts.values().map(|h| h.stop_all())).await;
        self.channel.close("node leaving");
        info!("Node {} left", self.node_id);
    }
}

impl Drop for NodeSession {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
