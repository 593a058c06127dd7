//! Error types for the message passer.

use thiserror::Error;

/// Errors that can occur while setting up or running the message passer.
#[derive(Error, Debug)]
pub enum MessagePasserError {
    /// Failed to serialize or deserialize a frame payload.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Frame exceeds the maximum allowed size.
    #[error("frame too large: {size} bytes (max {max} bytes)")]
    MessageTooLarge {
        /// Actual frame size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Transport-level I/O error.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The node name is not part of the directory.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// A peer completed the handshake under a name we were not waiting for.
    #[error("unexpected peer in handshake: {0}")]
    UnexpectedPeer(String),

    /// The handshake on a freshly accepted connection did not complete.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A peer stayed unreachable for the configured number of dial attempts.
    #[error("gave up dialing {name} after {attempts} attempts")]
    DialExhausted {
        /// The peer we tried to reach.
        name: String,
        /// How many dials were made.
        attempts: u32,
    },

    /// The same node name appears twice in the directory.
    #[error("duplicate node name: {0}")]
    DuplicateNode(String),

    /// The directory has no nodes at all.
    #[error("node directory is empty")]
    EmptyDirectory,

    /// A multicast timestamp does not have one entry per node.
    #[error("timestamp has {actual} entries, expected {expected}")]
    InvalidTimestamp {
        /// Number of nodes in the directory.
        expected: usize,
        /// Length of the received timestamp.
        actual: usize,
    },

    /// An internal queue was closed by its consumer.
    #[error("message passer channel closed")]
    ChannelClosed,

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<crate::config::ConfigError> for MessagePasserError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Convenience result type for message passer operations.
pub type Result<T> = std::result::Result<T, MessagePasserError>;
