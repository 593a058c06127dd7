//! Message types and serialization for mesh communication.
//!
//! Every byte sequence on a mesh connection is a length-prefixed bincode
//! encoding of a [`Frame`].  Because frames carry their own length, message
//! `content` and `kind` may hold arbitrary text.

use {
    crate::error::{MessagePasserError, Result},
    serde::{Deserialize, Serialize},
};

/// Destination name that addresses the whole group.
pub const MULTICAST_DESTINATION: &str = "EVERYBODY";

/// Message kinds shared with the UI bridge.
pub mod kind {
    pub const MSG_MYNAME: &str = "MSG_MYNAME";
    pub const MSG_GAME_TYPE: &str = "MSG_GAME_TYPE";
    pub const MSG_PADDLE_POS: &str = "MSG_PADDLE_POS";
    pub const MSG_PADDLE_DIR: &str = "MSG_PADDLE_DIR";
}

/// An application message.
///
/// `seq_num` and `timestamp` are stamped by the message passer when the
/// message is sent; whatever the application puts there is overwritten.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Message {
    /// Name of the originating node.
    pub source: String,
    /// Name of the receiving node, or [`MULTICAST_DESTINATION`].
    pub destination: String,
    pub content: String,
    pub kind: String,
    /// Per-destination sequence number (per-group for multicast).
    pub seq_num: u64,
    /// Vector timestamp, one entry per node.  Empty for unicast.
    pub timestamp: Vec<u64>,
}

impl Message {
    pub fn new(
        destination: impl Into<String>,
        kind: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            destination: destination.into(),
            kind: kind.into(),
            content: content.into(),
            ..Self::default()
        }
    }

    /// A message addressed to every node.
    pub fn multicast(kind: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(MULTICAST_DESTINATION, kind, content)
    }

    pub fn is_multicast(&self) -> bool {
        self.destination == MULTICAST_DESTINATION
    }

    /// True for the zero value, which is never transmitted.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Top-level wire type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Frame {
    /// First frame on every dialed connection, naming the dialer.
    Hello {
        name: String,
    },
    Data(Message),
}

impl Frame {
    /// Serialize this frame to bytes using bincode.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(MessagePasserError::Serialization)
    }

    /// Deserialize a frame from bytes.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(MessagePasserError::Serialization)
    }

    /// Serialize with a 4-byte little-endian length prefix.
    ///
    /// Wire format: `[len: u32-le][payload: len bytes]`
    pub fn serialize_framed(&self, max_size: usize) -> Result<Vec<u8>> {
        let payload = self.serialize()?;
        let too_large = || MessagePasserError::MessageTooLarge {
            size: payload.len(),
            max: max_size,
        };
        if payload.len() > max_size {
            return Err(too_large());
        }
        let len = u32::try_from(payload.len()).map_err(|_| too_large())?;
        let mut buf = Vec::with_capacity(4usize.saturating_add(payload.len()));
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Read the length prefix from a 4-byte buffer.
    pub fn read_frame_len(header: &[u8; 4]) -> usize {
        u32::from_le_bytes(*header) as usize
    }

    /// Return a short tag for logging.
    pub fn tag(&self) -> &str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Data(message) => message.kind.as_str(),
        }
    }
}
