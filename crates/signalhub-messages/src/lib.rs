//! Wire protocol types exchanged between a client session and its transport,
//! and between nodes in a cluster.
//!
//! This crate deliberately stops at *types*: framing, JSON/binary encoding and
//! the actual WebSocket/SockJS transport are external collaborators (see the
//! top-level crate docs). Everything here is plain, `serde`-serializable data.

pub mod client_info;
pub mod command;
pub mod control;
pub mod publication;

pub use client_info::{ClientId, ClientInfo, UserId};
pub use command::{Command, CommandId, Method, Push, Reply, ReplyError};
pub use control::{ControlMessage, ControlMethod, NodeInfo};
pub use publication::{Publication, StreamPosition};

/// A channel name. Opaque, non-empty, byte-exact equality.
///
/// Channels are created implicitly by subscription and destroyed when the
/// last subscriber leaves; this type carries no lifecycle of its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Channel(bytestring::ByteString);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel name must not be empty")]
    Empty,
    #[error("channel name exceeds the configured maximum length ({0} > {1})")]
    TooLong(usize, usize),
}

impl Channel {
    pub fn new(name: impl Into<bytestring::ByteString>) -> Result<Self, ChannelError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ChannelError::Empty);
        }
        Ok(Self(name))
    }

    /// Like [`Channel::new`] but additionally enforces `ChannelMaxLength`.
    pub fn new_checked(name: impl Into<bytestring::ByteString>, max_len: usize) -> Result<Self, ChannelError> {
        let channel = Self::new(name)?;
        if channel.0.len() > max_len {
            return Err(ChannelError::TooLong(channel.0.len(), max_len));
        }
        Ok(channel)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Channel {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
