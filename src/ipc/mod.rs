//! IPC - Message envelope, wire codec and per-peer channels

pub mod channel;
pub mod codec;
pub mod message;

pub use channel::{Channel, Inbound};
pub use codec::{AsyncStream, BoxStream, FrameReader, read_handshake, write_frame};
pub use message::{Admission, Hello, JoinRequest, Message, MessageKind, Payload, Target};

use sha2::{Digest, Sha256};

/// Hex SHA-256 of a shared secret. Secrets are only ever compared this way.
pub fn digest(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}
