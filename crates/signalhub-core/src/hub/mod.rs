//! The channel/session index (spec §4.2).
//!
//! Grounded on the teacher's `ClientActorIndex` (`client_connection_index.rs`):
//! an `Inner` struct behind a lock holding parallel maps, swap-remove-style
//! cleanup on the last unsubscribe. Generalized from one process-wide index
//! into `NUM_SHARDS` channel-keyed shards so that fan-out to channel A never
//! contends with a subscribe on unrelated channel B, and restated to hold
//! `Weak` subscriber handles as spec §5 requires ("Hub holds weak references
//! used only while a read lock is held").

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use signalhub_messages::client_info::ClientInfo;
use signalhub_messages::command::DisconnectPush;
use signalhub_messages::{Channel, ClientId, Publication, UserId};

use crate::config::ChannelBatchConfig;
use crate::error::HubError;

const NUM_SHARDS: usize = 16;

/// The minimal delivery surface the hub needs from a client session, kept as
/// a trait so the hub never depends on the concrete session type.
pub trait Subscriber: Send + Sync {
    fn client_id(&self) -> ClientId;
    /// Owned rather than borrowed: implementations typically keep the user
    /// id behind a lock (it can change on token refresh), so there is no
    /// `&UserId` to hand back without holding that lock open across the call.
    fn user_id(&self) -> UserId;

    /// Queue `publication` for delivery on `channel`, coalesced per that
    /// client's per-channel batching policy.
    fn deliver_publication(&self, channel: &Channel, publication: Publication, batch_cfg: ChannelBatchConfig);

    /// Deliver a join notification for `channel`.
    fn deliver_join(&self, channel: &Channel, info: ClientInfo);

    /// Deliver a leave notification for `channel`.
    fn deliver_leave(&self, channel: &Channel, info: ClientInfo);

    /// Force-close the session, e.g. from a control-plane `Disconnect`.
    fn disconnect(&self, reason: DisconnectPush);

    /// Drop `channel` from this session's subscriptions, e.g. from a
    /// control-plane `Unsubscribe`. Asynchronous bookkeeping (presence
    /// removal, join/leave notification) is the session's own concern; this
    /// call only needs to kick it off.
    fn force_unsubscribe(&self, channel: &Channel);
}

struct Shard {
    channels: RwLock<HashMap<Channel, HashMap<ClientId, Weak<dyn Subscriber>>>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }
}

fn shard_index(channel: &Channel) -> usize {
    let mut hasher = DefaultHasher::new();
    channel.as_str().hash(&mut hasher);
    (hasher.finish() as usize) % NUM_SHARDS
}

/// Process-wide index from channel to subscribers and from user to their
/// connected clients. One per [`crate::node::Node`].
pub struct Hub {
    shards: Vec<Shard>,
    clients: RwLock<HashMap<ClientId, Weak<dyn Subscriber>>>,
    users: RwLock<HashMap<UserId, HashSet<ClientId>>>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| Shard::new()).collect(),
            clients: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Register a freshly connected session so it is reachable by
    /// [`Hub::disconnect_user`] and counted by [`Hub::num_clients`]/
    /// [`Hub::num_users`], independent of any channel subscription.
    pub fn register_client(&self, subscriber: &Arc<dyn Subscriber>) {
        let client_id = subscriber.client_id();
        self.clients.write().insert(client_id, Arc::downgrade(subscriber));
        let user_id = subscriber.user_id();
        if !user_id.is_anonymous() {
            self.users.write().entry(user_id).or_default().insert(client_id);
        }
    }

    /// Remove a session entirely, including from every channel it was
    /// subscribed to. Called once, when a session closes.
    pub fn unregister_client(&self, client_id: ClientId, user_id: &UserId) {
        self.clients.write().remove(&client_id);
        if !user_id.is_anonymous() {
            let mut users = self.users.write();
            if let Some(set) = users.get_mut(user_id) {
                set.remove(&client_id);
                if set.is_empty() {
                    users.remove(user_id);
                }
            }
        }
        for shard in &self.shards {
            let mut channels = shard.channels.write();
            channels.retain(|_, subs| {
                subs.remove(&client_id);
                !subs.is_empty()
            });
        }
    }

    /// `AddSub`: returns `true` if this created the channel's first
    /// subscriber entry.
    pub fn add_sub(&self, channel: &Channel, subscriber: &Arc<dyn Subscriber>) -> bool {
        let shard = &self.shards[shard_index(channel)];
        let mut channels = shard.channels.write();
        let subs = channels.entry(channel.clone()).or_default();
        let is_first = subs.is_empty();
        subs.insert(subscriber.client_id(), Arc::downgrade(subscriber));
        is_first
    }

    /// `RemoveSub`: returns `Ok(was_last)`.
    pub fn remove_sub(&self, channel: &Channel, client_id: ClientId) -> Result<bool, HubError> {
        let shard = &self.shards[shard_index(channel)];
        let mut channels = shard.channels.write();
        let Some(subs) = channels.get_mut(channel) else {
            return Err(HubError::UnknownClient(client_id.0));
        };
        if subs.remove(&client_id).is_none() {
            return Err(HubError::UnknownClient(client_id.0));
        }
        let was_last = subs.is_empty();
        if was_last {
            channels.remove(channel);
        }
        Ok(was_last)
    }

    /// Snapshot the live subscribers of `channel` without holding the lock
    /// across delivery. Dead (dropped) weak refs are silently skipped; the
    /// owning session's own teardown is responsible for calling
    /// [`Hub::unregister_client`].
    fn snapshot(&self, channel: &Channel) -> Vec<Arc<dyn Subscriber>> {
        let shard = &self.shards[shard_index(channel)];
        let channels = shard.channels.read();
        match channels.get(channel) {
            Some(subs) => subs.values().filter_map(Weak::upgrade).collect(),
            None => Vec::new(),
        }
    }

    pub fn broadcast_publication(&self, channel: &Channel, publication: &Publication, batch_cfg: ChannelBatchConfig) {
        for subscriber in self.snapshot(channel) {
            subscriber.deliver_publication(channel, publication.clone(), batch_cfg);
        }
    }

    pub fn broadcast_join(&self, channel: &Channel, info: &ClientInfo) {
        for subscriber in self.snapshot(channel) {
            subscriber.deliver_join(channel, info.clone());
        }
    }

    pub fn broadcast_leave(&self, channel: &Channel, info: &ClientInfo) {
        for subscriber in self.snapshot(channel) {
            subscriber.deliver_leave(channel, info.clone());
        }
    }

    /// Disconnect every client belonging to `user_id`. Returns the number of
    /// sessions actually reached (a client whose weak ref had already died
    /// is not counted).
    pub fn disconnect_user(&self, user_id: &UserId, reason: DisconnectPush) -> usize {
        let client_ids: Vec<ClientId> = {
            let users = self.users.read();
            match users.get(user_id) {
                Some(set) => set.iter().copied().collect(),
                None => return 0,
            }
        };
        let clients = self.clients.read();
        let mut reached = 0;
        for client_id in client_ids {
            if let Some(subscriber) = clients.get(&client_id).and_then(Weak::upgrade) {
                subscriber.disconnect(reason.clone());
                reached += 1;
            }
        }
        reached
    }

    pub fn num_subscribers(&self, channel: &Channel) -> usize {
        let shard = &self.shards[shard_index(channel)];
        shard
            .channels
            .read()
            .get(channel)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    pub fn num_channels(&self) -> usize {
        self.shards.iter().map(|s| s.channels.read().len()).sum()
    }

    pub fn num_clients(&self) -> usize {
        self.clients.read().len()
    }

    pub fn num_users(&self) -> usize {
        self.users.read().len()
    }

    /// Every currently-connected client belonging to `user_id`, for
    /// control-plane operations (like a targeted `Unsubscribe`) that act on
    /// a user rather than one connection.
    pub fn client_ids_for_user(&self, user_id: &UserId) -> Vec<ClientId> {
        self.users
            .read()
            .get(user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Look up a live subscriber by client id, for control-plane operations
    /// that need to call back into one specific session.
    pub fn subscriber(&self, client_id: ClientId) -> Option<Arc<dyn Subscriber>> {
        self.clients.read().get(&client_id).and_then(Weak::upgrade)
    }

    /// Every currently-registered session, live weak refs only. Used by node
    /// shutdown to disconnect everyone without iterating per-channel shards.
    pub fn all_subscribers(&self) -> Vec<Arc<dyn Subscriber>> {
        self.clients.read().values().filter_map(Weak::upgrade).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct TestSubscriber {
        client_id: ClientId,
        user_id: UserId,
        publications: Mutex<Vec<(Channel, Publication)>>,
        joins: Mutex<Vec<Channel>>,
        leaves: Mutex<Vec<Channel>>,
        disconnected: Mutex<Option<DisconnectPush>>,
    }

    impl TestSubscriber {
        fn new(user_id: &str) -> Arc<Self> {
            Arc::new(Self {
                client_id: ClientId::generate(),
                user_id: UserId::from(user_id),
                publications: Mutex::new(Vec::new()),
                joins: Mutex::new(Vec::new()),
                leaves: Mutex::new(Vec::new()),
                disconnected: Mutex::new(None),
            })
        }

        fn as_dyn(self: &Arc<Self>) -> Arc<dyn Subscriber> {
            self.clone() as Arc<dyn Subscriber>
        }
    }

    impl Subscriber for TestSubscriber {
        fn client_id(&self) -> ClientId {
            self.client_id
        }
        fn user_id(&self) -> UserId {
            self.user_id.clone()
        }
        fn deliver_publication(&self, channel: &Channel, publication: Publication, _batch_cfg: ChannelBatchConfig) {
            self.publications.lock().push((channel.clone(), publication));
        }
        fn deliver_join(&self, channel: &Channel, _info: ClientInfo) {
            self.joins.lock().push(channel.clone());
        }
        fn deliver_leave(&self, channel: &Channel, _info: ClientInfo) {
            self.leaves.lock().push(channel.clone());
        }
        fn disconnect(&self, reason: DisconnectPush) {
            *self.disconnected.lock() = Some(reason);
        }
        fn force_unsubscribe(&self, _channel: &Channel) {}
    }

    #[test]
    fn add_sub_reports_first_subscriber() {
        let hub = Hub::new();
        let ch = Channel::new("room").unwrap();
        let a = TestSubscriber::new("alice");
        let b = TestSubscriber::new("bob");

        assert!(hub.add_sub(&ch, &a.as_dyn()));
        assert!(!hub.add_sub(&ch, &b.as_dyn()));
        assert_eq!(hub.num_subscribers(&ch), 2);
    }

    #[test]
    fn remove_sub_reports_was_last() {
        let hub = Hub::new();
        let ch = Channel::new("room").unwrap();
        let a = TestSubscriber::new("alice");
        hub.add_sub(&ch, &a.as_dyn());

        assert!(hub.remove_sub(&ch, a.client_id).unwrap());
        assert_eq!(hub.num_channels(), 0);
    }

    #[test]
    fn remove_sub_unknown_client_is_an_error() {
        let hub = Hub::new();
        let ch = Channel::new("room").unwrap();
        assert!(hub.remove_sub(&ch, ClientId::generate()).is_err());
    }

    #[test]
    fn broadcast_reaches_every_live_subscriber() {
        let hub = Hub::new();
        let ch = Channel::new("room").unwrap();
        let a = TestSubscriber::new("alice");
        let b = TestSubscriber::new("bob");
        hub.add_sub(&ch, &a.as_dyn());
        hub.add_sub(&ch, &b.as_dyn());

        hub.broadcast_publication(&ch, &Publication::transient("hi"), ChannelBatchConfig::unbatched());

        assert_eq!(a.publications.lock().len(), 1);
        assert_eq!(b.publications.lock().len(), 1);
    }

    #[test]
    fn dropped_subscriber_is_skipped_without_panicking() {
        let hub = Hub::new();
        let ch = Channel::new("room").unwrap();
        {
            let a = TestSubscriber::new("alice");
            hub.add_sub(&ch, &a.as_dyn());
        } // `a` drops; only the weak ref remains in the hub

        hub.broadcast_publication(&ch, &Publication::transient("hi"), ChannelBatchConfig::unbatched());
        // no panic means the upgrade-failure path worked; the stale entry is
        // cleaned up lazily on the next unregister/remove_sub.
    }

    #[test]
    fn disconnect_user_reaches_all_of_a_users_clients() {
        let hub = Hub::new();
        let a = TestSubscriber::new("alice");
        let a2 = TestSubscriber::new("alice");
        hub.register_client(&a.as_dyn());
        hub.register_client(&a2.as_dyn());

        let reached = hub.disconnect_user(&UserId::from("alice"), DisconnectPush::KICKED);
        assert_eq!(reached, 2);
        assert!(a.disconnected.lock().is_some());
        assert!(a2.disconnected.lock().is_some());
    }

    #[test]
    fn num_users_counts_distinct_users_not_clients() {
        let hub = Hub::new();
        let a1 = TestSubscriber::new("alice");
        let a2 = TestSubscriber::new("alice");
        let b = TestSubscriber::new("bob");
        hub.register_client(&a1.as_dyn());
        hub.register_client(&a2.as_dyn());
        hub.register_client(&b.as_dyn());

        assert_eq!(hub.num_clients(), 3);
        assert_eq!(hub.num_users(), 2);
    }

    #[test]
    fn all_subscribers_lists_every_registered_client() {
        let hub = Hub::new();
        let a = TestSubscriber::new("alice");
        let b = TestSubscriber::new("bob");
        hub.register_client(&a.as_dyn());
        hub.register_client(&b.as_dyn());

        let ids: HashSet<ClientId> = hub.all_subscribers().iter().map(|s| s.client_id()).collect();
        assert_eq!(ids, HashSet::from([a.client_id, b.client_id]));
    }

    #[test]
    fn unregister_client_removes_from_every_channel() {
        let hub = Hub::new();
        let a = TestSubscriber::new("alice");
        let ch1 = Channel::new("room1").unwrap();
        let ch2 = Channel::new("room2").unwrap();
        hub.register_client(&a.as_dyn());
        hub.add_sub(&ch1, &a.as_dyn());
        hub.add_sub(&ch2, &a.as_dyn());

        hub.unregister_client(a.client_id, &a.user_id);

        assert_eq!(hub.num_channels(), 0);
        assert_eq!(hub.num_clients(), 0);
        assert_eq!(hub.num_users(), 0);
    }
}
