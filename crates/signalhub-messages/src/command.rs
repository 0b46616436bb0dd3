use bytes::Bytes;

use crate::client_info::{ClientId, ClientInfo};
use crate::publication::{Publication, StreamPosition};
use crate::Channel;

/// Monotonically increasing, per-connection command identifier.
///
/// `0` is reserved for server-initiated pushes (never a real command id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub u32);

impl CommandId {
    pub const PUSH: Self = Self(0);

    pub fn is_push(self) -> bool {
        self == Self::PUSH
    }
}

/// The method recognized by a [`Command`], kept as a separate enum purely so
/// error replies (which know the method before they can decode `params`) can
/// name it without constructing a dummy payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Connect,
    Subscribe,
    Unsubscribe,
    Publish,
    Presence,
    PresenceStats,
    History,
    Rpc,
    Refresh,
    Send,
    Ping,
}

/// A decoded client command together with its ordering id.
///
/// The wire codec (JSON/binary, external to this crate) is responsible for
/// turning a raw frame into one or more `Command`s in decode order; this
/// crate only defines the decoded shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: CommandId,
    pub body: CommandBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandBody {
    Connect {
        token: Option<String>,
        subs: Vec<SubscribeRequest>,
        name: Option<String>,
    },
    Subscribe(SubscribeRequest),
    Unsubscribe { channel: Channel },
    Publish { channel: Channel, data: Bytes },
    Presence { channel: Channel },
    PresenceStats { channel: Channel },
    History(HistoryRequest),
    Rpc { method: String, data: Bytes },
    Refresh { token: String },
    Send { data: Bytes },
    Ping,
}

impl CommandBody {
    pub fn method(&self) -> Method {
        match self {
            Self::Connect { .. } => Method::Connect,
            Self::Subscribe(_) => Method::Subscribe,
            Self::Unsubscribe { .. } => Method::Unsubscribe,
            Self::Publish { .. } => Method::Publish,
            Self::Presence { .. } => Method::Presence,
            Self::PresenceStats { .. } => Method::PresenceStats,
            Self::History(_) => Method::History,
            Self::Rpc { .. } => Method::Rpc,
            Self::Refresh { .. } => Method::Refresh,
            Self::Send { .. } => Method::Send,
            Self::Ping => Method::Ping,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub channel: Channel,
    pub recover: bool,
    pub since: StreamPosition,
    pub presence: bool,
    pub join_leave: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub channel: Channel,
    pub limit: Option<u32>,
    pub since: Option<StreamPosition>,
    pub reverse: bool,
}

/// Server reply to a [`Command`], or a server-initiated [`Push`] when
/// `id == CommandId::PUSH`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub id: CommandId,
    pub outcome: ReplyOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    Result(ReplyResult),
    Error(ReplyError),
    Push(Push),
}

impl Reply {
    pub fn ok(id: CommandId, result: ReplyResult) -> Self {
        Self {
            id,
            outcome: ReplyOutcome::Result(result),
        }
    }

    pub fn err(id: CommandId, error: ReplyError) -> Self {
        Self {
            id,
            outcome: ReplyOutcome::Error(error),
        }
    }

    pub fn push(push: Push) -> Self {
        Self {
            id: CommandId::PUSH,
            outcome: ReplyOutcome::Push(push),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyResult {
    Connect {
        client_id: ClientId,
        expires: Option<chrono::DateTime<chrono::Utc>>,
        subs: Vec<SubscribeResult>,
    },
    Subscribe(SubscribeResult),
    Unsubscribe,
    Publish {
        position: StreamPosition,
    },
    Presence(std::collections::BTreeMap<ClientId, ClientInfo>),
    PresenceStats {
        num_clients: u64,
        num_users: u64,
    },
    History {
        publications: Vec<Publication>,
        position: StreamPosition,
    },
    Rpc(Bytes),
    Refresh {
        expires: Option<chrono::DateTime<chrono::Utc>>,
    },
    Pong,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeResult {
    pub channel: Channel,
    pub recoverable: bool,
    pub recovered: bool,
    pub publications_len: usize,
    pub position: StreamPosition,
}

/// An error reply to one command. Kept distinct from [`crate::ChannelError`]
/// and friends so that any component error can be classified into the wire
/// taxonomy from spec §7 uniformly.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReplyError {
    pub code: ErrorCode,
    pub message: String,
    /// If true, the client may retry the same command; the failure is
    /// believed to be transient (broker/presence/history unavailability).
    pub temporary: bool,
}

impl ReplyError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            temporary: false,
        }
    }

    pub fn temporary(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            temporary: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    TokenExpired,
    PermissionDenied,
    LimitExceeded,
    Internal,
    Unavailable,
}

/// A server-initiated message, delivered with [`CommandId::PUSH`].
#[derive(Debug, Clone, PartialEq)]
pub enum Push {
    Publication {
        channel: Channel,
        publication: Publication,
    },
    /// Several publications on one channel, coalesced by the sender's
    /// per-channel batching policy into a single frame.
    Publications {
        channel: Channel,
        publications: Vec<Publication>,
    },
    Join {
        channel: Channel,
        info: ClientInfo,
    },
    Leave {
        channel: Channel,
        info: ClientInfo,
    },
    Unsubscribe {
        channel: Channel,
    },
    Message {
        data: Bytes,
    },
    TokenExpiring,
    Disconnect(DisconnectPush),
}

/// Fatal disconnect instruction, per spec §7's "Fatal (disconnect)" kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectPush {
    pub code: u32,
    pub reason: DisconnectReason,
    pub reconnect: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Normal,
    Shutdown,
    Slow,
    Expired,
    Stale,
    ServerError,
    Kicked,
}

impl DisconnectPush {
    pub const SHUTDOWN: Self = Self {
        code: 3050,
        reason: DisconnectReason::Shutdown,
        reconnect: true,
    };
    pub const SLOW: Self = Self {
        code: 3051,
        reason: DisconnectReason::Slow,
        reconnect: true,
    };
    pub const EXPIRED: Self = Self {
        code: 3052,
        reason: DisconnectReason::Expired,
        reconnect: false,
    };
    pub const STALE: Self = Self {
        code: 3053,
        reason: DisconnectReason::Stale,
        reconnect: false,
    };
    pub const KICKED: Self = Self {
        code: 3054,
        reason: DisconnectReason::Kicked,
        reconnect: false,
    };
    pub const SERVER_ERROR: Self = Self {
        code: 3500,
        reason: DisconnectReason::ServerError,
        reconnect: true,
    };
}
