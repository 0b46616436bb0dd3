//! Client session state machine (spec §4.4): authenticates on `Connect`,
//! dispatches subsequent commands, and tears itself down on any fatal
//! error. Grounded on the teacher's `ClientConnection` (`client_connection.rs`):
//! a struct wrapping per-connection mutable state behind a lock, a
//! `process_message`-style dispatch matched on the incoming message kind,
//! and explicit `disconnect`/cleanup paths invoked from multiple places
//! (timeout, protocol error, peer close).

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use signalhub_messages::client_info::ClientInfo;
use signalhub_messages::command::{
    Command, CommandBody, DisconnectPush, HistoryRequest, Push, Reply, ReplyResult, SubscribeRequest, SubscribeResult,
};
use signalhub_messages::{Channel, ClientId, UserId};
use signalhub_auth::CredentialsHook;

use crate::batch::PerChannelWriter;
use crate::config::NodeConfig;
use crate::engine::{Broker, HistoryManager, PresenceManager};
use crate::error::SessionError;
use crate::hub::{Hub, Subscriber};
use signalhub_metrics::NodeMetrics;

use super::subscription::{recover, Subscription};

/// Where a session hands finished [`Reply`]/[`Push`] frames off to whatever
/// encodes and writes them to the wire. Implementations live outside this
/// crate (see [`crate::client::writer::TransportWriter`] for a reusable
/// bytes-level building block to wrap around one).
pub trait ReplySink: Send + Sync + 'static {
    /// Returns `false` if the sink is saturated; the caller must then treat
    /// this session as a fatal slow-consumer disconnect (spec §7).
    fn enqueue(&self, reply: Reply) -> bool;
}

/// Application hook invoked for an `Rpc` command. Left unconfigured by
/// default: a deployment that doesn't use custom RPC methods never needs
/// to implement one.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, client_id: ClientId, user_id: &UserId, method: &str, data: Bytes) -> Result<Bytes, SessionError>;
}

/// Application hook invoked for a `Send` command (fire-and-forget, no reply).
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, client_id: ClientId, user_id: &UserId, data: Bytes);
}

/// Collaborators a session needs, shared across every session on a node.
#[derive(Clone)]
pub struct SessionDeps {
    pub hub: Arc<Hub>,
    pub broker: Arc<dyn Broker>,
    pub presence: Arc<dyn PresenceManager>,
    pub history: Arc<dyn HistoryManager>,
    pub credentials: Arc<dyn CredentialsHook>,
    pub config: Arc<NodeConfig>,
    pub metrics: Arc<NodeMetrics>,
    pub rpc_handler: Option<Arc<dyn RpcHandler>>,
    pub message_handler: Option<Arc<dyn MessageHandler>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Closed,
}

struct Inner {
    state: SessionState,
    user_id: UserId,
    expires_at: Option<DateTime<Utc>>,
    /// Bumped every time `expires_at` changes (`Connect`/`Refresh`), so an
    /// already-scheduled token-expiry timer can tell it has been superseded
    /// and must not fire.
    token_epoch: u64,
    subscriptions: HashMap<Channel, Subscription>,
}

pub struct ClientSession {
    client_id: ClientId,
    deps: SessionDeps,
    reply_sink: Arc<dyn ReplySink>,
    batch_writer: PerChannelWriter,
    inner: Mutex<Inner>,
    self_ref: Mutex<Option<Weak<ClientSession>>>,
}

impl ClientSession {
    pub fn new(client_id: ClientId, deps: SessionDeps, reply_sink: Arc<dyn ReplySink>) -> Arc<Self> {
        let flush_sink = reply_sink.clone();
        let batch_writer = PerChannelWriter::new(move |channel: Channel, mut items: Vec<_>| {
            let push = if items.len() == 1 {
                Push::Publication {
                    channel,
                    publication: items.pop().unwrap(),
                }
            } else {
                Push::Publications {
                    channel,
                    publications: items,
                }
            };
            flush_sink.enqueue(Reply::push(push));
        });

        let this = Arc::new(Self {
            client_id,
            deps,
            reply_sink,
            batch_writer,
            inner: Mutex::new(Inner {
                state: SessionState::Connecting,
                user_id: UserId::anonymous(),
                expires_at: None,
                token_epoch: 0,
                subscriptions: HashMap::new(),
            }),
            self_ref: Mutex::new(None),
        });
        *this.self_ref.lock() = Some(Arc::downgrade(&this));
        Self::schedule_stale_connect_timeout(&this);
        this
    }

    /// Close the session with [`DisconnectPush::STALE`] if it is still
    /// `Connecting` once `client_connect_timeout` elapses (spec §4.4).
    fn schedule_stale_connect_timeout(session: &Arc<Self>) {
        let session = session.clone();
        let timeout = session.deps.config.client_connect_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if session.state() == SessionState::Connecting {
                session.close(DisconnectPush::STALE);
            }
        });
    }

    /// Set `expires_at` and bump the token epoch, returning the new epoch so
    /// the caller can arm a timer keyed to it.
    fn set_expiry(&self, expires_at: Option<DateTime<Utc>>) -> u64 {
        let mut inner = self.inner.lock();
        inner.expires_at = expires_at;
        inner.token_epoch += 1;
        inner.token_epoch
    }

    /// Push `TokenExpiring` when `expires_at` arrives, then close with
    /// [`DisconnectPush::EXPIRED`] after `client_expired_close_delay` unless
    /// a later `Connect`/`Refresh` has since bumped the token epoch.
    fn schedule_token_expiry(&self, expires_at: DateTime<Utc>, epoch: u64) {
        let session = self.arc_self();
        let grace = self.deps.config.client_expired_close_delay;
        tokio::spawn(async move {
            let delay = (expires_at - Utc::now()).to_std().unwrap_or(std::time::Duration::ZERO);
            tokio::time::sleep(delay).await;
            if session.inner.lock().token_epoch != epoch {
                return;
            }
            session.reply_sink.enqueue(Reply::push(Push::TokenExpiring));
            tokio::time::sleep(grace).await;
            if session.inner.lock().token_epoch == epoch {
                session.close(DisconnectPush::EXPIRED);
            }
        });
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    fn arc_self(&self) -> Arc<Self> {
        self.self_ref
            .lock()
            .clone()
            .expect("self_ref set in new()")
            .upgrade()
            .expect("session outlives its own Arc")
    }

    fn as_subscriber(&self) -> Arc<dyn Subscriber> {
        self.arc_self() as Arc<dyn Subscriber>
    }

    /// Dispatch one decoded command. Returns `None` when the protocol has no
    /// reply for this command (`Send`), `Some(reply)` otherwise. A returned
    /// `SessionError::Fatal` means the caller must close the connection
    /// after delivering the disconnect push.
    pub async fn handle_command(&self, command: Command) -> Option<Reply> {
        let id = command.id;
        let method_result = self.dispatch(command.body).await;
        match method_result {
            Ok(Some(result)) => Some(Reply::ok(id, result)),
            Ok(None) => None,
            Err(err) => {
                if err.is_fatal() {
                    if let SessionError::Fatal { reason } = err {
                        self.close(reason);
                    }
                    None
                } else {
                    Some(Reply::err(id, err.as_reply_error().expect("non-fatal has a reply error")))
                }
            }
        }
    }

    async fn dispatch(&self, body: CommandBody) -> Result<Option<ReplyResult>, SessionError> {
        if self.state() == SessionState::Closed {
            return Err(SessionError::Fatal {
                reason: DisconnectPush::SERVER_ERROR,
            });
        }
        if self.state() == SessionState::Connecting && !matches!(body, CommandBody::Connect { .. }) {
            return Err(SessionError::BadRequest("connect must be the first command".into()));
        }

        match body {
            CommandBody::Connect { token, subs, name: _ } => self.handle_connect(token, subs).await.map(Some),
            CommandBody::Subscribe(req) => self.handle_subscribe(req).await.map(Some),
            CommandBody::Unsubscribe { channel } => self.handle_unsubscribe(channel).await.map(Some),
            CommandBody::Publish { channel, data } => self.handle_publish(channel, data).await.map(Some),
            CommandBody::Presence { channel } => self.handle_presence(channel).await.map(Some),
            CommandBody::PresenceStats { channel } => self.handle_presence_stats(channel).await.map(Some),
            CommandBody::History(req) => self.handle_history(req).await.map(Some),
            CommandBody::Rpc { method, data } => self.handle_rpc(method, data).await.map(Some),
            CommandBody::Refresh { token } => self.handle_refresh(token).await.map(Some),
            CommandBody::Send { data } => {
                self.handle_send(data).await;
                Ok(None)
            }
            CommandBody::Ping => Ok(Some(ReplyResult::Pong)),
        }
    }

    async fn handle_connect(&self, token: Option<String>, subs: Vec<SubscribeRequest>) -> Result<ReplyResult, SessionError> {
        let claims = self
            .deps
            .credentials
            .authenticate(token.as_deref().unwrap_or(""))
            .await
            .map_err(|err| SessionError::Unauthorized(err.to_string()))?;

        {
            let mut inner = self.inner.lock();
            inner.user_id = claims.user_id.clone();
            inner.state = SessionState::Connected;
        }
        let epoch = self.set_expiry(claims.expires_at);
        if let Some(expires_at) = claims.expires_at {
            self.schedule_token_expiry(expires_at, epoch);
        }
        self.deps.hub.register_client(&self.as_subscriber());
        self.deps.metrics.sessions_spawned_total.inc();

        let mut results = Vec::with_capacity(subs.len());
        for req in subs {
            results.push(self.subscribe(req).await?);
        }

        Ok(ReplyResult::Connect {
            client_id: self.client_id,
            expires: claims.expires_at,
            subs: results,
        })
    }

    async fn handle_refresh(&self, token: String) -> Result<ReplyResult, SessionError> {
        let claims = self
            .deps
            .credentials
            .authenticate(&token)
            .await
            .map_err(|_| SessionError::TokenExpired)?;
        let epoch = self.set_expiry(claims.expires_at);
        if let Some(expires_at) = claims.expires_at {
            self.schedule_token_expiry(expires_at, epoch);
        }
        Ok(ReplyResult::Refresh {
            expires: claims.expires_at,
        })
    }

    /// Register with the hub *before* recovering history, so a publication
    /// the hub fans out in the gap between that registration and the
    /// history snapshot lands in the subscription's recovery buffer instead
    /// of being lost (spec §4.5). Any failure past registration rolls the
    /// subscription back out of both `inner.subscriptions` and the hub.
    async fn subscribe(&self, req: SubscribeRequest) -> Result<SubscribeResult, SessionError> {
        let channel = Channel::new_checked(req.channel.as_str(), self.deps.config.channel_max_length)?;

        let mut subscription = Subscription::new(req.presence, req.join_leave);
        if req.recover {
            subscription.begin_recovery();
        }
        self.inner.lock().subscriptions.insert(channel.clone(), subscription);

        let is_first = self.deps.hub.add_sub(&channel, &self.as_subscriber());

        match self.finish_subscribe(&channel, is_first, &req).await {
            Ok(result) => Ok(result),
            Err(err) => {
                self.inner.lock().subscriptions.remove(&channel);
                if let Ok(true) = self.deps.hub.remove_sub(&channel, self.client_id) {
                    let _ = self.deps.broker.unsubscribe(&channel).await;
                }
                Err(err)
            }
        }
    }

    async fn finish_subscribe(
        &self,
        channel: &Channel,
        is_first: bool,
        req: &SubscribeRequest,
    ) -> Result<SubscribeResult, SessionError> {
        if is_first {
            self.deps.broker.subscribe(channel).await?;
        }

        let (publications_len, position, recovered) = if req.recover {
            let result = recover(self.deps.history.as_ref(), channel, req.since, self.deps.config.history_size as u32).await?;
            let len = result.publications.len();
            let merged = {
                let mut inner = self.inner.lock();
                inner
                    .subscriptions
                    .get_mut(channel)
                    .expect("subscription inserted before recovery started")
                    .finish_recovery(result.publications)
            };
            for publication in merged {
                self.deps.metrics.publications_total.inc();
                let push = Push::Publication {
                    channel: channel.clone(),
                    publication,
                };
                self.reply_sink.enqueue(Reply::push(push));
            }
            (len, result.position, result.recovered)
        } else {
            let position = self.deps.history.current_position(channel).await?;
            (0, position, false)
        };

        if let Some(subscription) = self.inner.lock().subscriptions.get_mut(channel) {
            subscription.advance(position);
        }

        if req.presence {
            let info = ClientInfo::new(self.client_id, self.inner.lock().user_id.clone());
            self.deps.presence.add(channel, info.clone()).await?;
            if req.join_leave {
                self.deps.broker.publish_join(channel, info).await?;
            }
        }

        Ok(SubscribeResult {
            channel: channel.clone(),
            recoverable: position.offset > 0,
            recovered,
            publications_len,
            position,
        })
    }

    async fn handle_subscribe(&self, req: SubscribeRequest) -> Result<ReplyResult, SessionError> {
        Ok(ReplyResult::Subscribe(self.subscribe(req).await?))
    }

    async fn handle_unsubscribe(&self, channel: Channel) -> Result<ReplyResult, SessionError> {
        self.unsubscribe(&channel).await?;
        Ok(ReplyResult::Unsubscribe)
    }

    async fn unsubscribe(&self, channel: &Channel) -> Result<(), SessionError> {
        let subscription = self.inner.lock().subscriptions.remove(channel);
        let Some(subscription) = subscription else {
            return Ok(());
        };
        let was_last = self.deps.hub.remove_sub(channel, self.client_id)?;
        if was_last {
            self.deps.broker.unsubscribe(channel).await?;
        }
        if subscription.presence {
            self.deps.presence.remove(channel, self.client_id).await?;
            if subscription.join_leave {
                let info = ClientInfo::new(self.client_id, self.inner.lock().user_id.clone());
                self.deps.broker.publish_leave(channel, info).await?;
            }
        }
        Ok(())
    }

    async fn handle_publish(&self, channel: Channel, data: Bytes) -> Result<ReplyResult, SessionError> {
        let channel = Channel::new_checked(channel.as_str(), self.deps.config.channel_max_length)?;
        let info = ClientInfo::new(self.client_id, self.inner.lock().user_id.clone());
        let publication = self
            .deps
            .history
            .add(&channel, data, Some(info), None)
            .await?;
        self.deps.metrics.publications_total.inc();
        let position = publication.position();
        self.deps.broker.publish(&channel, publication).await?;
        Ok(ReplyResult::Publish { position })
    }

    async fn handle_presence(&self, channel: Channel) -> Result<ReplyResult, SessionError> {
        let snapshot = self.deps.presence.get(&channel).await?;
        Ok(ReplyResult::Presence(snapshot))
    }

    async fn handle_presence_stats(&self, channel: Channel) -> Result<ReplyResult, SessionError> {
        let stats = self.deps.presence.stats(&channel).await?;
        Ok(ReplyResult::PresenceStats {
            num_clients: stats.num_clients,
            num_users: stats.num_users,
        })
    }

    async fn handle_history(&self, req: HistoryRequest) -> Result<ReplyResult, SessionError> {
        let (publications, position) = self
            .deps
            .history
            .get(&req.channel, req.since, req.limit, req.reverse)
            .await?;
        Ok(ReplyResult::History { publications, position })
    }

    async fn handle_rpc(&self, method: String, data: Bytes) -> Result<ReplyResult, SessionError> {
        let Some(handler) = &self.deps.rpc_handler else {
            return Err(SessionError::Internal("no rpc handler configured".into()));
        };
        let user_id = self.inner.lock().user_id.clone();
        let result = handler.handle(self.client_id, &user_id, &method, data).await?;
        Ok(ReplyResult::Rpc(result))
    }

    async fn handle_send(&self, data: Bytes) {
        if let Some(handler) = &self.deps.message_handler {
            let user_id = self.inner.lock().user_id.clone();
            handler.handle(self.client_id, &user_id, data).await;
        }
    }

    /// Tear the session down: unsubscribe from everything, deregister from
    /// the hub, push a `Disconnect` frame, and close the write queue.
    pub fn close(&self, reason: DisconnectPush) {
        let (user_id, channels): (UserId, Vec<Channel>) = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Closed {
                return;
            }
            inner.state = SessionState::Closed;
            (inner.user_id.clone(), inner.subscriptions.keys().cloned().collect())
        };
        let mut last_channels = Vec::new();
        for channel in channels {
            if let Ok(true) = self.deps.hub.remove_sub(&channel, self.client_id) {
                last_channels.push(channel);
            }
        }
        if !last_channels.is_empty() {
            let broker = self.deps.broker.clone();
            tokio::spawn(async move {
                for channel in last_channels {
                    let _ = broker.unsubscribe(&channel).await;
                }
            });
        }
        self.deps.hub.unregister_client(self.client_id, &user_id);
        self.deps.metrics.sessions_closed_total.inc();
        self.reply_sink.enqueue(Reply::push(Push::Disconnect(reason)));
        self.batch_writer.close(false);
    }
}

impl Subscriber for ClientSession {
    fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn user_id(&self) -> UserId {
        self.inner.lock().user_id.clone()
    }

    fn deliver_publication(&self, channel: &Channel, publication: signalhub_messages::Publication, batch_cfg: crate::config::ChannelBatchConfig) {
        // A subscription mid-recovery buffers live publications instead of
        // delivering them, so they can be merged with the catch-up stream
        // once history recovery lands (spec §4.5).
        let publication = {
            let mut inner = self.inner.lock();
            match inner.subscriptions.get_mut(channel) {
                Some(subscription) => subscription.buffer_if_recovering(publication),
                None => Some(publication),
            }
        };
        if let Some(publication) = publication {
            self.batch_writer.add(publication, channel.clone(), batch_cfg);
        }
    }

    fn deliver_join(&self, channel: &Channel, info: ClientInfo) {
        self.reply_sink.enqueue(Reply::push(Push::Join {
            channel: channel.clone(),
            info,
        }));
    }

    fn deliver_leave(&self, channel: &Channel, info: ClientInfo) {
        self.reply_sink.enqueue(Reply::push(Push::Leave {
            channel: channel.clone(),
            info,
        }));
    }

    fn disconnect(&self, reason: DisconnectPush) {
        self.close(reason);
    }

    fn force_unsubscribe(&self, channel: &Channel) {
        let this = self.arc_self();
        let channel = channel.clone();
        tokio::spawn(async move {
            let _ = this.unsubscribe(&channel).await;
            this.reply_sink.enqueue(Reply::push(Push::Unsubscribe { channel }));
        });
    }
}
