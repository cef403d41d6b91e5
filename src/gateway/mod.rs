//! Remote gateway - lets other machines contribute slots
//!
//! A node connects, presents `{node_id, credentials_token, capacity}` and,
//! once admitted, gets `capacity` slots in the slot manager. Those slots use
//! the same message envelope as local ones, multiplexed over the node's one
//! connection by `Target::Slot`. Heartbeats keep the slots healthy: after
//! `missed_heartbeats` silent periods they are degraded, after the silence
//! window they are terminated.

pub mod node;

pub use node::{NodeAgent, NodeSession};

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::config::GatewayConfig;
use crate::core::{Error, NodeId, RemoteNode, Result, SlotId};
use crate::ipc::{Admission, AsyncStream, Channel, Hello, Inbound, JoinRequest, digest, read_handshake, write_frame};
use crate::slots::ProcessSlotManager;

struct NodeEntry {
    info: RemoteNode,
    channel: Channel,
    last_seen: Instant,
    degraded: bool,
}

pub struct RemoteGateway {
    config: GatewayConfig,
    token_digest: String,
    slots: Arc<ProcessSlotManager>,
    inbound: flume::Sender<Inbound>,
    nodes: RwLock<HashMap<NodeId, NodeEntry>>,
    /// Admitted but not attached yet
    joining: Mutex<HashSet<NodeId>>,
    addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RemoteGateway {
    pub fn new(config: GatewayConfig, slots: Arc<ProcessSlotManager>, inbound: flume::Sender<Inbound>) -> Arc<Self> {
        let token_digest = digest(&config.token);
        Arc::new(Self {
            config,
            token_digest,
            slots,
            inbound,
            nodes: RwLock::new(HashMap::new()),
            joining: Mutex::new(HashSet::new()),
            addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Bind the join listener and start heartbeat monitoring.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        let addr = listener.local_addr()?;
        *self.addr.lock() = Some(addr);
        info!("🌐 Remote gateway listening on {}", addr);

        let accept = {
            let gateway: Weak<Self> = Arc::downgrade(self);
            tokio::spawn(async move {
                loop {
                    let (stream, peer) = match listener.accept().await {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("Gateway accept failed: {}", e);
                            continue;
                        }
                    };
                    let Some(gateway) = gateway.upgrade() else { break };
                    tokio::spawn(async move {
                        if let Err(e) = gateway.join(stream, peer.to_string()).await {
                            warn!("Join from {} refused: {}", peer, e);
                        }
                    });
                }
            })
        };

        let monitor = {
            let gateway: Weak<Self> = Arc::downgrade(self);
            let period = self.config.heartbeat();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    interval.tick().await;
                    let Some(gateway) = gateway.upgrade() else { break };
                    gateway.check_heartbeats(Instant::now());
                }
            })
        };

        self.tasks.lock().extend([accept, monitor]);
        Ok(addr)
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        *self.addr.lock()
    }

    /// Check credentials and capacity of a join request.
    pub fn validate(&self, request: &JoinRequest) -> Result<()> {
        if self.config.token.is_empty() {
            return Err(Error::Auth("gateway has no token configured".into()));
        }
        if digest(&request.credentials_token) != self.token_digest {
            return Err(Error::Auth(format!("invalid credentials for node {}", request.node_id)));
        }
        if request.capacity == 0 {
            return Err(Error::Auth(format!("node {} offers no capacity", request.node_id)));
        }
        Ok(())
    }

    /// Run the join handshake on a fresh connection. On success the node's
    /// slots are `Ready` and the connection carries their traffic.
    pub async fn join<S: AsyncStream>(self: &Arc<Self>, mut stream: S, address: String) -> Result<Vec<SlotId>> {
        let timeout = self.config.handshake_timeout();
        let hello: Hello = tokio::time::timeout(timeout, read_handshake(&mut stream))
            .await
            .map_err(|_| Error::timeout("join handshake", timeout))??;

        let request = match hello {
            Hello::Join(request) => request,
            Hello::Slot { .. } => {
                write_frame(&mut stream, &Admission::reject("not a slot listener")).await?;
                return Err(Error::Auth("slot hello on the gateway".into()));
            }
        };

        if let Err(e) = self.validate(&request).and_then(|_| self.reserve(&request.node_id)) {
            write_frame(&mut stream, &Admission::reject(e.to_string())).await?;
            return Err(e);
        }

        let node = request.node_id.clone();
        let ids = self.slots.allocate_remote(&node, request.capacity);
        let admission = Admission::accept(ids.clone(), self.slots.workers_per_slot());
        if let Err(e) = write_frame(&mut stream, &admission).await {
            self.joining.lock().remove(&node);
            for id in &ids {
                let _ = self.slots.terminate_slot(*id, "join aborted");
            }
            return Err(e);
        }

        let channel = Channel::spawn(format!("node-{node}"), stream, self.inbound.clone());
        self.slots.attach_remote(&node, &ids, channel.clone());
        {
            let mut nodes = self.nodes.write();
            nodes.insert(
                node.clone(),
                NodeEntry {
                    info: RemoteNode {
                        id: node.clone(),
                        address,
                        token_digest: digest(&request.credentials_token),
                        slots: ids.clone(),
                        last_heartbeat: Utc::now(),
                        current_load: 0,
                    },
                    channel: channel.clone(),
                    last_seen: Instant::now(),
                    degraded: false,
                },
            );
            self.joining.lock().remove(&node);
        }
        info!("🤝 Node {} joined with {} slots", node, ids.len());

        let gateway: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            channel.closed().await;
            if let Some(gateway) = gateway.upgrade() {
                let reason = channel.closed_reason().unwrap_or_else(|| "connection closed".into());
                gateway.remove_node(&node, &reason);
            }
        });
        Ok(ids)
    }

    fn reserve(&self, node: &NodeId) -> Result<()> {
        let nodes = self.nodes.read();
        let mut joining = self.joining.lock();
        if nodes.contains_key(node) || !joining.insert(node.clone()) {
            return Err(Error::Auth(format!("node {node} is already joined")));
        }
        Ok(())
    }

    /// Record a heartbeat; degraded slots of the node recover.
    pub fn on_heartbeat(&self, node: &NodeId, timestamp: DateTime<Utc>, current_load: usize) -> Result<()> {
        let recovered = {
            let mut nodes = self.nodes.write();
            let entry = nodes
                .get_mut(node)
                .ok_or_else(|| Error::Lifecycle(format!("heartbeat from unknown node {node}")))?;
            entry.last_seen = Instant::now();
            entry.info.last_heartbeat = timestamp;
            entry.info.current_load = current_load;
            std::mem::take(&mut entry.degraded).then(|| entry.info.slots.clone())
        };
        debug!("Heartbeat from {} (load {})", node, current_load);
        for id in recovered.unwrap_or_default() {
            let _ = self.slots.recover(id);
        }
        Ok(())
    }

    /// Degrade nodes that missed too many heartbeats, drop those silent for
    /// longer than the silence window.
    pub fn check_heartbeats(&self, now: Instant) {
        let degrade_after = self.config.heartbeat() * self.config.missed_heartbeats;
        let silence_window = self.config.silence_window();

        let mut degrade = vec![];
        let mut silent_nodes = vec![];
        {
            let mut nodes = self.nodes.write();
            for entry in nodes.values_mut() {
                let silent = now.saturating_duration_since(entry.last_seen);
                if silent >= silence_window {
                    silent_nodes.push((entry.info.id.clone(), silent));
                } else if silent >= degrade_after && !entry.degraded {
                    entry.degraded = true;
                    degrade.push((entry.info.id.clone(), entry.info.slots.clone(), silent));
                }
            }
        }

        for (node, slots, silent) in degrade {
            warn!("⚠️ Node {} missed heartbeats for {:?}", node, silent);
            for id in slots {
                let _ = self.slots.mark_degraded(id, &format!("node {node} missed heartbeats"));
            }
        }
        for (node, silent) in silent_nodes {
            self.remove_node(&node, &format!("silent for {silent:?}"));
        }
    }

    /// Forget a node: its slots are terminated and its connection closed.
    pub fn remove_node(&self, node: &NodeId, reason: &str) {
        let Some(entry) = self.nodes.write().remove(node) else { return };
        warn!("🔌 Node {} removed: {}", node, reason);
        for id in &entry.info.slots {
            let _ = self.slots.terminate_slot(*id, &format!("node {node}: {reason}"));
        }
        entry.channel.close(reason.to_string());
    }

    pub fn nodes(&self) -> Vec<RemoteNode> {
        let mut nodes: Vec<_> = self.nodes.read().values().map(|e| e.info.clone()).collect();
        nodes.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        nodes
    }

    pub fn node(&self, id: &NodeId) -> Option<RemoteNode> {
        self.nodes.read().get(id).map(|e| e.info.clone())
    }

    /// Stop accepting joins and drop every node.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let ids: Vec<NodeId> = self.nodes.read().keys().cloned().collect();
        for id in ids {
            self.remove_node(&id, "engine shutdown");
        }
    }
}

impl Drop for RemoteGateway {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
