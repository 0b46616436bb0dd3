use std::time::Duration;

use crate::client_info::UserId;
use crate::Channel;

/// A message exchanged between nodes of a cluster over the broker's control
/// channel. Delivered to every node, including the sender.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    /// Identifier of the node that emitted this message.
    pub uid: String,
    pub method: ControlMethod,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMethod {
    /// Periodic heartbeat carrying this node's liveness/shape.
    Node(NodeInfo),
    /// Cluster-wide unsubscribe: drop `user` from `channel` on every node
    /// that currently has them subscribed.
    Unsubscribe { user: UserId, channel: Channel },
    /// Cluster-wide disconnect: close every session belonging to `user` on
    /// every node.
    Disconnect { user: UserId, reason: String },
    /// Cluster-wide survey request/response pair, used by admin tooling to
    /// gather per-node stats; the payload is opaque to the core engine.
    Survey { request_id: String, payload: Vec<u8> },
}

/// Shape of the periodic `NODE` heartbeat, published at `NodeInfoPublishInterval`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub version: String,
    pub num_clients: u64,
    pub num_users: u64,
    pub num_channels: u64,
    pub uptime: Duration,
}
