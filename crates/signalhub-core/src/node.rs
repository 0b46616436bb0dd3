//! The node (spec §4.8): owns the hub and the three plug-points, mints
//! sessions, and bridges broker events back into local fan-out. Grounded on
//! the teacher's top-level `ClientActorIndex`/`DatabaseInstanceContext`
//! ownership shape: one long-lived struct holding every shared collaborator,
//! handed out to per-connection state as `Arc` clones.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use signalhub_auth::CredentialsHook;
use signalhub_messages::client_info::ClientInfo;
use signalhub_messages::command::{DisconnectPush, DisconnectReason};
use signalhub_messages::control::{ControlMessage, ControlMethod, NodeInfo};
use signalhub_messages::{Channel, ClientId, Publication, StreamPosition, UserId};
use signalhub_metrics::NodeMetrics;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::client::session::{ClientSession, MessageHandler, ReplySink, RpcHandler, SessionDeps};
use crate::config::NodeConfig;
use crate::engine::{Broker, BrokerEventHandler, HistoryManager, MemoryBroker, MemoryHistoryManager, MemoryPresenceManager, PresenceManager, PresenceStats};
use crate::error::SessionError;
use crate::hub::Hub;

fn disconnect_reason_tag(push: &DisconnectPush) -> &'static str {
    match push.reason {
        DisconnectReason::Normal => "normal",
        DisconnectReason::Shutdown => "shutdown",
        DisconnectReason::Slow => "slow",
        DisconnectReason::Expired => "expired",
        DisconnectReason::Stale => "stale",
        DisconnectReason::ServerError => "server_error",
        DisconnectReason::Kicked => "kicked",
    }
}

fn disconnect_push_from_tag(tag: &str) -> DisconnectPush {
    match tag {
        "shutdown" => DisconnectPush::SHUTDOWN,
        "slow" => DisconnectPush::SLOW,
        "expired" => DisconnectPush::EXPIRED,
        "stale" => DisconnectPush::STALE,
        "server_error" => DisconnectPush::SERVER_ERROR,
        _ => DisconnectPush::KICKED,
    }
}

/// Everything needed to stand a node up beyond its configuration: the
/// credentials hook is mandatory (there is no sane default for production,
/// [`signalhub_auth::AnonymousCredentialsHook`] exists for tests/dev), the
/// three plug-points default to the in-memory reference implementations.
pub struct NodeBuilder {
    config: NodeConfig,
    credentials: Arc<dyn CredentialsHook>,
    broker: Option<Arc<dyn Broker>>,
    presence: Option<Arc<dyn PresenceManager>>,
    history: Option<Arc<dyn HistoryManager>>,
    rpc_handler: Option<Arc<dyn RpcHandler>>,
    message_handler: Option<Arc<dyn MessageHandler>>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig, credentials: Arc<dyn CredentialsHook>) -> Self {
        Self {
            config,
            credentials,
            broker: None,
            presence: None,
            history: None,
            rpc_handler: None,
            message_handler: None,
        }
    }

    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_presence(mut self, presence: Arc<dyn PresenceManager>) -> Self {
        self.presence = Some(presence);
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryManager>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_rpc_handler(mut self, handler: Arc<dyn RpcHandler>) -> Self {
        self.rpc_handler = Some(handler);
        self
    }

    pub fn with_message_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.message_handler = Some(handler);
        self
    }

    pub fn build(self) -> Arc<Node> {
        let history = self
            .history
            .unwrap_or_else(|| MemoryHistoryManager::new(self.config.history_size, self.config.history_ttl, self.config.history_size as u32));
        let presence = self.presence.unwrap_or_else(|| {
            MemoryPresenceManager::new(
                self.config.presence_ttl,
                self.config.presence_refresh_interval,
                self.config.presence_user_mapping,
            )
        });
        let broker = self.broker.unwrap_or_else(|| Arc::new(MemoryBroker::new()));

        let node = Arc::new(Node {
            uid: ClientId::generate().to_string(),
            config: Arc::new(self.config),
            hub: Arc::new(Hub::new()),
            broker,
            presence,
            history,
            credentials: self.credentials,
            metrics: Arc::new(NodeMetrics::new()),
            rpc_handler: self.rpc_handler,
            message_handler: self.message_handler,
            shut_down: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            heartbeat_task: parking_lot::Mutex::new(None),
        });

        node.broker.set_event_handler(node.clone() as Arc<dyn BrokerEventHandler>);
        node.start_heartbeat();
        node
    }
}

/// A running messaging node. Cheap to clone (it's always handed around as
/// `Arc<Node>`); construct one with [`NodeBuilder`].
pub struct Node {
    uid: String,
    config: Arc<NodeConfig>,
    hub: Arc<Hub>,
    broker: Arc<dyn Broker>,
    presence: Arc<dyn PresenceManager>,
    history: Arc<dyn HistoryManager>,
    credentials: Arc<dyn CredentialsHook>,
    metrics: Arc<NodeMetrics>,
    rpc_handler: Option<Arc<dyn RpcHandler>>,
    message_handler: Option<Arc<dyn MessageHandler>>,
    shut_down: AtomicBool,
    shutdown_notify: Notify,
    heartbeat_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn metrics(&self) -> &Arc<NodeMetrics> {
        &self.metrics
    }

    /// Mint a new session bound to this node's collaborators. The caller
    /// owns `reply_sink` and is responsible for actually driving bytes to
    /// the transport; this crate stops at the `Reply`/`Push` boundary.
    /// Returns `None` once the node has started shutting down.
    pub fn new_session(&self, reply_sink: Arc<dyn ReplySink>) -> Option<Arc<ClientSession>> {
        if self.shut_down.load(Ordering::Acquire) {
            return None;
        }
        let deps = SessionDeps {
            hub: self.hub.clone(),
            broker: self.broker.clone(),
            presence: self.presence.clone(),
            history: self.history.clone(),
            credentials: self.credentials.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            rpc_handler: self.rpc_handler.clone(),
            message_handler: self.message_handler.clone(),
        };
        Some(ClientSession::new(ClientId::generate(), deps, reply_sink))
    }

    /// Programmatic, non-client publish (e.g. a server-side job posting a
    /// notification). Assigns a position via the history manager exactly as
    /// a client `Publish` command would.
    pub async fn publish(&self, channel: &Channel, data: Bytes) -> Result<StreamPosition, SessionError> {
        let publication = self.history.add(channel, data, None, None).await?;
        self.metrics.publications_total.inc();
        let position = publication.position();
        self.broker.publish(channel, publication).await?;
        Ok(position)
    }

    pub async fn presence(&self, channel: &Channel) -> Result<std::collections::BTreeMap<ClientId, ClientInfo>, SessionError> {
        Ok(self.presence.get(channel).await?)
    }

    pub async fn presence_stats(&self, channel: &Channel) -> Result<PresenceStats, SessionError> {
        Ok(self.presence.stats(channel).await?)
    }

    /// Disconnect every session belonging to `user_id`, on this node and any
    /// other node sharing this node's broker.
    pub async fn disconnect_user(&self, user_id: &UserId, reason: DisconnectPush) -> Result<(), SessionError> {
        let message = ControlMessage {
            uid: self.uid.clone(),
            method: ControlMethod::Disconnect {
                user: user_id.clone(),
                reason: disconnect_reason_tag(&reason).to_string(),
            },
        };
        self.broker.publish_control(message).await?;
        Ok(())
    }

    /// Force every session belonging to `user_id` off `channel`, cluster-wide.
    pub async fn unsubscribe_user(&self, user_id: &UserId, channel: &Channel) -> Result<(), SessionError> {
        let message = ControlMessage {
            uid: self.uid.clone(),
            method: ControlMethod::Unsubscribe {
                user: user_id.clone(),
                channel: channel.clone(),
            },
        };
        self.broker.publish_control(message).await?;
        Ok(())
    }

    pub fn num_clients(&self) -> usize {
        self.hub.num_clients()
    }

    pub fn num_users(&self) -> usize {
        self.hub.num_users()
    }

    pub fn num_channels(&self) -> usize {
        self.hub.num_channels()
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let node = self.clone();
        let interval = self.config.node_info_publish_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = node.shutdown_notify.notified() => return,
                }
                if node.shut_down.load(Ordering::Acquire) {
                    return;
                }
                let info = NodeInfo {
                    name: node.config.node_name.clone(),
                    version: node.config.version.clone(),
                    num_clients: node.hub.num_clients() as u64,
                    num_users: node.hub.num_users() as u64,
                    num_channels: node.hub.num_channels() as u64,
                    uptime: Duration::from_secs(0),
                };
                let _ = node
                    .broker
                    .publish_control(ControlMessage {
                        uid: node.uid.clone(),
                        method: ControlMethod::Node(info),
                    })
                    .await;
            }
        });
        *self.heartbeat_task.lock() = Some(handle);
    }

    /// Flip the shut-down flag and abort the heartbeat loop. Returns `true`
    /// the one time it actually performed the transition. Synchronous so it
    /// can run from [`Drop::drop`].
    fn shutdown_sync(&self) -> bool {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shutdown_notify.notify_waiters();
        if let Some(handle) = self.heartbeat_task.lock().take() {
            handle.abort();
        }
        true
    }

    /// Stop accepting new cluster traffic, disconnect every currently
    /// connected session with [`DisconnectPush::SHUTDOWN`], and close the
    /// broker/presence/history plug-points. Idempotent.
    pub async fn shutdown(&self) {
        if !self.shutdown_sync() {
            return;
        }
        for subscriber in self.hub.all_subscribers() {
            subscriber.disconnect(DisconnectPush::SHUTDOWN);
        }
        self.broker.close().await;
        self.presence.close().await;
        self.history.close().await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl BrokerEventHandler for Node {
    fn handle_publication(&self, channel: &Channel, publication: Publication) {
        let batch_cfg = self.config.channel_batch_config(channel);
        self.hub.broadcast_publication(channel, &publication, batch_cfg);
    }

    fn handle_join(&self, channel: &Channel, info: ClientInfo) {
        self.hub.broadcast_join(channel, &info);
    }

    fn handle_leave(&self, channel: &Channel, info: ClientInfo) {
        self.hub.broadcast_leave(channel, &info);
    }

    fn handle_control(&self, message: ControlMessage) {
        match message.method {
            ControlMethod::Disconnect { user, reason } => {
                self.hub.disconnect_user(&user, disconnect_push_from_tag(&reason));
            }
            ControlMethod::Unsubscribe { user, channel } => {
                for client_id in self.hub.client_ids_for_user(&user) {
                    if let Some(subscriber) = self.hub.subscriber(client_id) {
                        subscriber.force_unsubscribe(&channel);
                    }
                }
            }
            ControlMethod::Node(_) | ControlMethod::Survey { .. } => {
                // Cluster membership/surveys have no meaning for a single
                // in-memory node; a clustered broker would handle these in
                // its own control-plane layer instead of reaching here.
            }
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown_sync();
    }
}
