//! Error handling - Hierarchical errors that survive a process boundary

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Orchestrator error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    /// No eligible slot had spare capacity
    #[error("Placement error: {0}")]
    Placement(String),

    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("Unknown component: {0}")]
    UnknownComponent(String),

    /// A name is already registered for that kind
    #[error("Duplicate {kind} name: {name}")]
    DuplicateName { kind: &'static str, name: String },

    /// Component construction, open or close failed
    #[error("Component error: {0}")]
    Component(String),

    /// The hosting slot could not build the worker
    #[error("Worker creation failed: {0}")]
    WorkerCreation(String),

    /// Channel closed, peer unreachable, malformed frame
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out after {after:?}: {what}")]
    Timeout { what: String, after: Duration },

    /// Handshake rejected
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Operation not valid in the current lifecycle state
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error("Unknown slot: {0}")]
    UnknownSlot(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        Error::Timeout {
            what: what.into(),
            after,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Placement(_) => ErrorCode::Placement,
            Error::UnknownStrategy(_) => ErrorCode::UnknownStrategy,
            Error::UnknownComponent(_) => ErrorCode::UnknownComponent,
            Error::DuplicateName { .. } => ErrorCode::DuplicateName,
            Error::Component(_) => ErrorCode::Component,
            Error::WorkerCreation(_) => ErrorCode::WorkerCreation,
            Error::Transport(_) | Error::Io(_) => ErrorCode::Transport,
            Error::Timeout { .. } => ErrorCode::Timeout,
            Error::Auth(_) => ErrorCode::Auth,
            Error::Lifecycle(_) => ErrorCode::Lifecycle,
            Error::Config(_) => ErrorCode::Config,
            Error::UnknownWorker(_) => ErrorCode::UnknownWorker,
            Error::UnknownSlot(_) => ErrorCode::UnknownSlot,
            Error::Serialization(_) => ErrorCode::Serialization,
        }
    }

    /// Wire form, sent back in a `Failed` response.
    pub fn to_remote(&self) -> RemoteError {
        let message = match self {
            Error::Placement(m)
            | Error::UnknownStrategy(m)
            | Error::UnknownComponent(m)
            | Error::Component(m)
            | Error::WorkerCreation(m)
            | Error::Transport(m)
            | Error::Auth(m)
            | Error::Lifecycle(m)
            | Error::Config(m)
            | Error::UnknownWorker(m)
            | Error::UnknownSlot(m) => m.clone(),
            other => other.to_string(),
        };
        RemoteError {
            code: self.code(),
            message,
        }
    }

    /// Rebuild a local error from its wire form.
    pub fn from_remote(remote: RemoteError) -> Self {
        let m = remote.message;
        match remote.code {
            ErrorCode::Placement => Error::Placement(m),
            ErrorCode::UnknownStrategy => Error::UnknownStrategy(m),
            ErrorCode::UnknownComponent => Error::UnknownComponent(m),
            ErrorCode::DuplicateName => Error::DuplicateName {
                kind: "remote",
                name: m,
            },
            ErrorCode::Component => Error::Component(m),
            ErrorCode::WorkerCreation => Error::WorkerCreation(m),
            ErrorCode::Transport => Error::Transport(m),
            ErrorCode::Timeout => Error::Timeout {
                what: m,
                after: Duration::ZERO,
            },
            ErrorCode::Auth => Error::Auth(m),
            ErrorCode::Lifecycle => Error::Lifecycle(m),
            ErrorCode::Config => Error::Config(m),
            ErrorCode::UnknownWorker => Error::UnknownWorker(m),
            ErrorCode::UnknownSlot => Error::UnknownSlot(m),
            ErrorCode::Serialization => Error::Transport(m),
        }
    }
}

/// Stable error category for the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Placement,
    UnknownStrategy,
    UnknownComponent,
    DuplicateName,
    Component,
    WorkerCreation,
    Transport,
    Timeout,
    Auth,
    Lifecycle,
    Config,
    UnknownWorker,
    UnknownSlot,
    Serialization,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: ErrorCode,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_component_crosses_boundary() {
        let err = Error::UnknownComponent("persistence".into());
        let wire = serde_json::to_string(&err.to_remote()).unwrap();
        let back: RemoteError = serde_json::from_str(&wire).unwrap();
        match Error::from_remote(back) {
            Error::UnknownComponent(name) => assert_eq!(name, "persistence"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_io_maps_to_transport() {
        let err = Error::from(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"));
        assert_eq!(err.code(), ErrorCode::Transport);
    }
}
