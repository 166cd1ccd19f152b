//! Bridge error types.

use std::time::Duration;

/// Errors that can occur in the cleepbus_network crate.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// A message does not have a valid envelope shape (neither command nor
    /// event, not a JSON object, ...).
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// An `extra` value cannot be represented as JSON.
    #[error("Value for key '{key}' is not JSON serializable")]
    NonSerializable { key: String },

    /// A message arrived for (or was addressed to) a peer the directory does
    /// not know.
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// The internal queue is at capacity.
    #[error("Internal queue is full")]
    QueueFull,

    /// The other end of the internal queue was dropped.
    #[error("Internal queue is closed")]
    QueueClosed,

    /// A transport-level error (WebSocket connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Discovery subsystem error.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Errors that are expected during normal operation and only worth a log
    /// line.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::QueueFull | Self::Timeout(_) | Self::Transport(_)
        )
    }

    /// Errors caused by a caller handing over a malformed or misaddressed
    /// message.
    pub fn is_protocol_misuse(&self) -> bool {
        matches!(
            self,
            Self::InvalidMessage(_) | Self::UnknownPeer(_) | Self::NonSerializable { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
