//! Presence plug-point (spec §4.7): who is subscribed to a channel right
//! now, and how many distinct clients/users that represents.

use std::collections::BTreeMap;

use async_trait::async_trait;
use signalhub_messages::client_info::ClientInfo;
use signalhub_messages::{Channel, ClientId};

use crate::error::PresenceError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresenceStats {
    pub num_clients: u64,
    pub num_users: u64,
}

#[async_trait]
pub trait PresenceManager: Send + Sync {
    /// Record that `info.client_id` is present on `channel`, refreshing its
    /// TTL if already present.
    async fn add(&self, channel: &Channel, info: ClientInfo) -> Result<(), PresenceError>;

    /// Remove one client's presence entry. Not an error if the entry is
    /// already gone (TTL expiry may have raced a session's own unsubscribe).
    async fn remove(&self, channel: &Channel, client_id: ClientId) -> Result<(), PresenceError>;

    async fn get(&self, channel: &Channel) -> Result<BTreeMap<ClientId, ClientInfo>, PresenceError>;

    async fn stats(&self, channel: &Channel) -> Result<PresenceStats, PresenceError>;

    /// Stop any background maintenance (TTL sweeps). Called once, from node
    /// shutdown.
    async fn close(&self);
}
