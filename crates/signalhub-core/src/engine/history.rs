//! History plug-point (spec §4.7): an append-only, bounded, per-channel log
//! used both to assign each recoverable publication its [`StreamPosition`]
//! and to let a resubscribing client recover what it missed.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use signalhub_messages::client_info::ClientInfo;
use signalhub_messages::{Channel, Publication, StreamPosition};

use crate::error::HistoryError;

#[async_trait]
pub trait HistoryManager: Send + Sync {
    /// Append a publication to `channel`'s history, assigning it the next
    /// offset in the channel's current epoch. Channels are created lazily on
    /// first use and dropped once both their TTL has elapsed and no session
    /// still references them.
    async fn add(
        &self,
        channel: &Channel,
        data: Bytes,
        info: Option<ClientInfo>,
        tags: Option<BTreeMap<String, String>>,
    ) -> Result<Publication, HistoryError>;

    /// Return every publication strictly after `since` (or the whole
    /// retained window if `since` is `None`), plus the channel's current
    /// position. A `since.epoch` that no longer matches the channel's
    /// current epoch means the retained window can't answer the request;
    /// callers must treat that as "can't recover" rather than an error.
    async fn get(
        &self,
        channel: &Channel,
        since: Option<StreamPosition>,
        limit: Option<u32>,
        reverse: bool,
    ) -> Result<(Vec<Publication>, StreamPosition), HistoryError>;

    async fn current_position(&self, channel: &Channel) -> Result<StreamPosition, HistoryError>;

    /// Drop all retained history for `channel`, bumping its epoch so any
    /// client still holding a position from before the removal is told its
    /// recovery state is stale rather than silently served a gap.
    async fn remove_channel(&self, channel: &Channel) -> Result<(), HistoryError>;

    /// Stop any background maintenance (TTL sweeps). Called once, from node
    /// shutdown.
    async fn close(&self);
}
