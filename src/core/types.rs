//! Core types - Strong typing for ids, specs and lifecycle state machines

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form key/value configuration handed to strategies and components.
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// Process slot identifier, unique for the lifetime of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub u32);

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// Worker identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Remote node identifier (chosen by the node itself)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a worker is allowed to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    #[default]
    Any,
    /// Wraps a resource that cannot leave this machine
    LocalOnly,
}

impl Placement {
    /// The stricter of two placements.
    pub fn merge(self, other: Placement) -> Placement {
        match (self, other) {
            (Placement::Any, Placement::Any) => Placement::Any,
            _ => Placement::LocalOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    /// Singleton in the control process
    Core,
    /// One instance per worker, next to the worker
    Strategy,
}

/// Requirements a slot must satisfy to receive a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotRequirements {
    pub placement: Placement,
}

impl SlotRequirements {
    pub fn local_only() -> Self {
        Self {
            placement: Placement::LocalOnly,
        }
    }

    pub fn accepts(&self, slot: &ProcessSlot) -> bool {
        match self.placement {
            Placement::Any => true,
            Placement::LocalOnly => slot.location.is_local(),
        }
    }
}

/// What to run: a registered strategy, its config and the strategy
/// components it needs. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Registered strategy name
    pub strategy: String,

    /// Instance configuration
    #[serde(default)]
    pub config: ConfigMap,

    /// Strategy components bound before the strategy is constructed
    #[serde(default)]
    pub components: Vec<String>,

    #[serde(default)]
    pub placement: Placement,
}

impl WorkerSpec {
    pub fn new(strategy: impl Into<String>) -> Self {
        Self {
            strategy: strategy.into(),
            config: ConfigMap::new(),
            components: vec![],
            placement: Placement::Any,
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_component(mut self, name: impl Into<String>) -> Self {
        self.components.push(name.into());
        self
    }

    pub fn local_only(mut self) -> Self {
        self.placement = Placement::LocalOnly;
        self
    }
}

/// Worker lifecycle.
///
/// `Pending -> Running -> Stopping -> Stopped`, with `Lost` reachable from
/// `Running`/`Stopping` when the hosting slot fails. A running worker that
/// exits on its own goes straight to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Pending,
    Running,
    Stopping,
    Stopped,
    Lost,
}

impl WorkerState {
    pub fn can_transition(self, to: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Stopping, Stopped)
                | (Running, Lost)
                | (Stopping, Lost)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Lost)
    }

    /// Still occupying a place on its slot
    pub fn is_active(self) -> bool {
        matches!(self, WorkerState::Running | WorkerState::Stopping)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Pending => "pending",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
            WorkerState::Lost => "lost",
        };
        f.write_str(s)
    }
}

/// Handle on a strategy-component instance living in the hosting process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHandle {
    pub name: String,
    /// Unique per instantiation, never shared between workers
    pub instance: Uuid,
}

/// A running worker as seen by the control process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInstance {
    pub id: WorkerId,
    pub spec: WorkerSpec,
    pub slot: SlotId,
    pub state: WorkerState,
    pub components: Vec<ComponentHandle>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Why the worker left `Running`, when known
    pub reason: Option<String>,
}

/// Slot lifecycle.
///
/// `Starting -> Ready -> Draining -> Terminated`, with `Degraded` entered from
/// `Ready` on missed heartbeats or an unreachable channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Starting,
    Ready,
    Draining,
    Degraded,
    Terminated,
}

impl SlotState {
    pub fn can_transition(self, to: SlotState) -> bool {
        use SlotState::*;
        matches!(
            (self, to),
            (Starting, Ready)
                | (Starting, Terminated)
                | (Ready, Draining)
                | (Ready, Degraded)
                | (Ready, Terminated)
                | (Degraded, Ready)
                | (Degraded, Draining)
                | (Degraded, Terminated)
                | (Draining, Terminated)
        )
    }

    /// Counts against the local slot limit
    pub fn is_live(self) -> bool {
        matches!(self, SlotState::Ready | SlotState::Degraded)
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SlotState::Starting => "starting",
            SlotState::Ready => "ready",
            SlotState::Draining => "draining",
            SlotState::Degraded => "degraded",
            SlotState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Where a slot's host runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SlotLocation {
    Local { pid: Option<u32> },
    Remote { node: NodeId },
}

impl SlotLocation {
    pub fn is_local(&self) -> bool {
        matches!(self, SlotLocation::Local { .. })
    }
}

/// One worker-hosting process, local or remote
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSlot {
    pub id: SlotId,
    pub location: SlotLocation,
    /// Max concurrent workers
    pub capacity: usize,
    /// Reservations plus running workers
    pub load: usize,
    pub state: SlotState,
    pub started_at: DateTime<Utc>,
}

impl ProcessSlot {
    pub fn spare(&self) -> usize {
        self.capacity.saturating_sub(self.load)
    }
}

/// A remote host contributing slots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteNode {
    pub id: NodeId,
    pub address: String,
    /// SHA-256 of the token the node authenticated with
    pub token_digest: String,
    pub slots: Vec<SlotId>,
    pub last_heartbeat: DateTime<Utc>,
    pub current_load: usize,
}
