//! Error taxonomy, composed the way `crates/core/src/error.rs` composes
//! `TableError`/`IndexError`/`ClientError` in the teacher crate: one
//! `thiserror` enum per concern, plus a classification into the wire-level
//! kinds from spec §7 so the session dispatch loop can map any component
//! error into the right per-command-vs-fatal reply uniformly.

use signalhub_messages::command::{ErrorCode, ReplyError};
use signalhub_messages::ChannelError;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("client {0} is not connected")]
    UnknownClient(uuid::Uuid),
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker is unavailable: {0}")]
    Unavailable(String),
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("presence backend is unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history backend is unavailable: {0}")]
    Unavailable(String),
    #[error("requested limit {0} exceeds the configured maximum {1}")]
    LimitExceeded(u32, u32),
}

/// The taxonomy from spec §7, independent of which component raised it.
///
/// `Fatal` carries the disconnect payload the session should push before
/// tearing the connection down; every other variant becomes a per-command
/// error reply and the connection is kept.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("token expired")]
    TokenExpired,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("fatal: {reason:?}")]
    Fatal {
        reason: signalhub_messages::command::DisconnectPush,
    },
}

impl SessionError {
    /// Build the per-command error reply for every variant except `Fatal`,
    /// which the caller must handle by closing the connection instead.
    pub fn as_reply_error(&self) -> Option<ReplyError> {
        match self {
            Self::BadRequest(msg) => Some(ReplyError::new(ErrorCode::BadRequest, msg)),
            Self::Unauthorized(msg) => Some(ReplyError::new(ErrorCode::Unauthorized, msg)),
            Self::TokenExpired => Some(ReplyError::new(ErrorCode::TokenExpired, "token expired")),
            Self::PermissionDenied(msg) => Some(ReplyError::new(ErrorCode::PermissionDenied, msg)),
            Self::LimitExceeded(msg) => Some(ReplyError::new(ErrorCode::LimitExceeded, msg)),
            Self::Internal(msg) => Some(ReplyError::new(ErrorCode::Internal, msg)),
            Self::Unavailable(msg) => Some(ReplyError::temporary(ErrorCode::Unavailable, msg)),
            Self::Fatal { .. } => None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

impl From<BrokerError> for SessionError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Unavailable(msg) => Self::Unavailable(msg),
            BrokerError::Channel(err) => Self::BadRequest(err.to_string()),
        }
    }
}

impl From<PresenceError> for SessionError {
    fn from(err: PresenceError) -> Self {
        match err {
            PresenceError::Unavailable(msg) => Self::Unavailable(msg),
        }
    }
}

impl From<HistoryError> for SessionError {
    fn from(err: HistoryError) -> Self {
        match err {
            HistoryError::Unavailable(msg) => Self::Unavailable(msg),
            HistoryError::LimitExceeded(got, max) => {
                Self::LimitExceeded(format!("requested limit {got} exceeds maximum {max}"))
            }
        }
    }
}

impl From<ChannelError> for SessionError {
    fn from(err: ChannelError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<HubError> for SessionError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::Channel(err) => Self::BadRequest(err.to_string()),
            HubError::UnknownClient(id) => Self::Internal(format!("unknown client {id}")),
        }
    }
}
