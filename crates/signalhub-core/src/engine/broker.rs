//! The pub/sub fan-out plug-point (spec §4.7). A `Broker` only needs to
//! deliver messages published on one node to every node subscribed to the
//! same channel (including itself); it never decides *whether* a channel is
//! recoverable — that is [`crate::engine::history::HistoryManager`]'s job, so
//! swapping a broker (in-memory today, a pub/sub bus tomorrow) never changes
//! recovery semantics.

use async_trait::async_trait;
use signalhub_messages::client_info::ClientInfo;
use signalhub_messages::control::ControlMessage;
use signalhub_messages::{Channel, Publication};

use crate::error::BrokerError;

/// Registered once by the owning [`crate::node::Node`] to receive fanned-out
/// events, playing the role the teacher's connection-index callbacks play
/// for `client_connection_index.rs`: the transport between "a message
/// arrived for this channel" and "deliver it to local subscribers" is kept
/// as a seam so a distributed broker can call the same hook from a network
/// receive loop that an in-memory one calls synchronously.
pub trait BrokerEventHandler: Send + Sync {
    fn handle_publication(&self, channel: &Channel, publication: Publication);
    fn handle_join(&self, channel: &Channel, info: ClientInfo);
    fn handle_leave(&self, channel: &Channel, info: ClientInfo);
    fn handle_control(&self, message: ControlMessage);
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Install the node's event handler. Called exactly once, before the
    /// broker is used for anything else.
    fn set_event_handler(&self, handler: std::sync::Arc<dyn BrokerEventHandler>);

    async fn publish(&self, channel: &Channel, publication: Publication) -> Result<(), BrokerError>;
    async fn publish_join(&self, channel: &Channel, info: ClientInfo) -> Result<(), BrokerError>;
    async fn publish_leave(&self, channel: &Channel, info: ClientInfo) -> Result<(), BrokerError>;
    async fn publish_control(&self, message: ControlMessage) -> Result<(), BrokerError>;

    /// Mark this node as interested in `channel`. A no-op for brokers that
    /// fan out to every node unconditionally; required for ones that use
    /// real pub/sub subscriptions under the hood.
    async fn subscribe(&self, channel: &Channel) -> Result<(), BrokerError>;
    async fn unsubscribe(&self, channel: &Channel) -> Result<(), BrokerError>;

    /// Stop participating in the cluster. Called once, from node shutdown;
    /// no `publish*`/`subscribe`/`unsubscribe` call is expected afterward.
    async fn close(&self);
}
