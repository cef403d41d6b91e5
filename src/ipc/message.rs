//! Message envelope shared by local slots and remote nodes

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::{ComponentHandle, ConfigMap, NodeId, RemoteError, SlotId, WorkerId, WorkerSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Expects exactly one response with the same conversation id
    Command,
    Response,
    /// Fire-and-forget
    Event,
}

/// Who a message is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Core,
    Slot(SlotId),
    Worker(WorkerId),
}

/// One frame on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub conversation: Uuid,
    pub kind: MessageKind,
    pub target: Target,
    pub payload: Payload,
}

impl Message {
    pub fn command(target: Target, payload: Payload) -> Self {
        Self {
            conversation: Uuid::new_v4(),
            kind: MessageKind::Command,
            target,
            payload,
        }
    }

    pub fn event(target: Target, payload: Payload) -> Self {
        Self {
            conversation: Uuid::new_v4(),
            kind: MessageKind::Event,
            target,
            payload,
        }
    }

    /// Answer to `command`, reusing its conversation id.
    pub fn response(command: &Message, target: Target, payload: Payload) -> Self {
        Self {
            conversation: command.conversation,
            kind: MessageKind::Response,
            target,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Payload {
    // control -> slot
    CreateWorker {
        worker: WorkerId,
        spec: WorkerSpec,
        /// `[components.<name>]` for each requested component
        #[serde(default)]
        settings: BTreeMap<String, ConfigMap>,
    },
    StopWorker {
        worker: WorkerId,
    },
    /// Drop a worker whose creation the control side gave up on
    AbortWorker {
        worker: WorkerId,
    },
    Deliver {
        worker: WorkerId,
        topic: String,
        #[serde(default)]
        data: Value,
    },
    Ping,
    /// Close every worker and exit
    Shutdown,

    // slot -> control
    WorkerExited {
        worker: WorkerId,
        reason: String,
    },
    CoreEvent {
        origin: WorkerId,
        component: String,
        topic: String,
        #[serde(default)]
        data: Value,
    },
    CoreCall {
        origin: WorkerId,
        component: String,
        method: String,
        #[serde(default)]
        data: Value,
    },
    Heartbeat {
        node: NodeId,
        timestamp: DateTime<Utc>,
        current_load: usize,
    },

    // responses
    Ack {
        #[serde(default)]
        data: Value,
    },
    Created {
        worker: WorkerId,
        components: Vec<ComponentHandle>,
    },
    Failed {
        error: RemoteError,
    },
}

impl Payload {
    pub fn ack() -> Self {
        Payload::Ack { data: Value::Null }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Payload::CreateWorker { .. } => "create_worker",
            Payload::StopWorker { .. } => "stop_worker",
            Payload::AbortWorker { .. } => "abort_worker",
            Payload::Deliver { .. } => "deliver",
            Payload::Ping => "ping",
            Payload::Shutdown => "shutdown",
            Payload::WorkerExited { .. } => "worker_exited",
            Payload::CoreEvent { .. } => "core_event",
            Payload::CoreCall { .. } => "core_call",
            Payload::Heartbeat { .. } => "heartbeat",
            Payload::Ack { .. } => "ack",
            Payload::Created { .. } => "created",
            Payload::Failed { .. } => "failed",
        }
    }
}

/// Remote join request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub node_id: NodeId,
    pub credentials_token: String,
    /// Slots the node is willing to host
    pub capacity: usize,
}

/// First frame on a fresh connection, before any `Message`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "hello", rename_all = "snake_case")]
pub enum Hello {
    /// A local slot process connecting back to its parent
    Slot {
        slot: SlotId,
        auth_key: String,
        pid: u32,
    },
    Join(JoinRequest),
}

/// Reply to a `Hello`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Admission {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Slot ids assigned to a joining node
    #[serde(default)]
    pub slots: Vec<SlotId>,
    #[serde(default)]
    pub workers_per_slot: usize,
}

impl Admission {
    pub fn accept(slots: Vec<SlotId>, workers_per_slot: usize) -> Self {
        Self {
            accepted: true,
            reason: None,
            slots,
            workers_per_slot,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_keeps_conversation() {
        let cmd = Message::command(Target::Slot(SlotId(2)), Payload::Ping);
        let resp = Message::response(&cmd, Target::Core, Payload::ack());
        assert_eq!(resp.conversation, cmd.conversation);
        assert_eq!(resp.kind, MessageKind::Response);

        let a = Message::event(Target::Core, Payload::Ping);
        let b = Message::event(Target::Core, Payload::Ping);
        assert_ne!(a.conversation, b.conversation);
    }

    #[test]
    fn test_wire_shape() {
        let msg = Message::command(
            Target::Worker(WorkerId::new()),
            Payload::StopWorker { worker: WorkerId::new() },
        );
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["kind"], "command");
        assert_eq!(v["payload"]["op"], "stop_worker");
        assert!(v["target"]["worker"].is_string());

        let hello: Hello = serde_json::from_str(
            r#"{"hello":"join","node_id":"n1","credentials_token":"t","capacity":2}"#,
        )
        .unwrap();
        assert!(matches!(hello, Hello::Join(JoinRequest { capacity: 2, .. })));
    }
}
