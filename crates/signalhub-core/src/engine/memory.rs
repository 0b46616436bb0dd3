//! In-process reference implementations of the three plug-points (spec
//! §4.7.1): a single-node broker that calls its event handler directly, and
//! presence/history managers backed by sharded-by-channel `HashMap`s with
//! TTL expiry swept lazily on read plus a periodic background pass, per the
//! open-question resolutions recorded alongside this spec. Grounded on the
//! teacher's general pattern of a `Mutex`-guarded per-entity state struct
//! behind a process-wide `HashMap` (`db_metrics`'s per-database registry
//! shape, `client_connection_index.rs`'s `Inner`).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::Rng as _;
use signalhub_messages::client_info::ClientInfo;
use signalhub_messages::control::ControlMessage;
use signalhub_messages::{Channel, ClientId, Publication, StreamPosition, UserId};
use tokio::task::JoinHandle;

use crate::error::{BrokerError, HistoryError, PresenceError};

use super::broker::{Broker, BrokerEventHandler};
use super::history::HistoryManager;
use super::presence::{PresenceManager, PresenceStats};

/// Single-node broker: publishing *is* delivering, there being no other node
/// to reach. A clustered broker swaps this file out, not the trait.
pub struct MemoryBroker {
    handler: RwLock<Option<Arc<dyn BrokerEventHandler>>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            handler: RwLock::new(None),
        }
    }

    fn handler(&self) -> Arc<dyn BrokerEventHandler> {
        self.handler
            .read()
            .clone()
            .expect("Broker used before set_event_handler")
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn set_event_handler(&self, handler: Arc<dyn BrokerEventHandler>) {
        *self.handler.write() = Some(handler);
    }

    async fn publish(&self, channel: &Channel, publication: Publication) -> Result<(), BrokerError> {
        self.handler().handle_publication(channel, publication);
        Ok(())
    }

    async fn publish_join(&self, channel: &Channel, info: ClientInfo) -> Result<(), BrokerError> {
        self.handler().handle_join(channel, info);
        Ok(())
    }

    async fn publish_leave(&self, channel: &Channel, info: ClientInfo) -> Result<(), BrokerError> {
        self.handler().handle_leave(channel, info);
        Ok(())
    }

    async fn publish_control(&self, message: ControlMessage) -> Result<(), BrokerError> {
        self.handler().handle_control(message);
        Ok(())
    }

    async fn subscribe(&self, _channel: &Channel) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn unsubscribe(&self, _channel: &Channel) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn close(&self) {}
}

struct ChannelLog {
    items: VecDeque<Publication>,
    epoch: u64,
    next_offset: u64,
    last_touched: Instant,
}

impl ChannelLog {
    fn fresh() -> Self {
        Self {
            items: VecDeque::new(),
            epoch: rand::rng().random(),
            next_offset: 0,
            last_touched: Instant::now(),
        }
    }

    fn position(&self) -> StreamPosition {
        StreamPosition {
            offset: self.next_offset,
            epoch: self.epoch,
        }
    }

    fn expired(&self, ttl: Duration) -> bool {
        self.last_touched.elapsed() > ttl
    }
}

/// Bounded ring of publications per channel, with a random epoch minted each
/// time a channel's log is (re)created so a recovering client whose
/// remembered epoch no longer matches can tell its history is gone rather
/// than silently getting a truncated replay.
pub struct MemoryHistoryManager {
    channels: RwLock<HashMap<Channel, Mutex<ChannelLog>>>,
    size: usize,
    ttl: Duration,
    max_limit: u32,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryHistoryManager {
    pub fn new(size: usize, ttl: Duration, max_limit: u32) -> Arc<Self> {
        let this = Arc::new(Self {
            channels: RwLock::new(HashMap::new()),
            size,
            ttl,
            max_limit,
            sweep_task: Mutex::new(None),
        });
        let sweep_target = this.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval((sweep_target.ttl / 4).max(Duration::from_secs(1)));
            loop {
                interval.tick().await;
                sweep_target
                    .channels
                    .write()
                    .retain(|_, log| !log.lock().expired(sweep_target.ttl));
            }
        });
        *this.sweep_task.lock() = Some(handle);
        this
    }
}

impl MemoryHistoryManager {
    fn abort_sweep(&self) {
        if let Some(handle) = self.sweep_task.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for MemoryHistoryManager {
    fn drop(&mut self) {
        self.abort_sweep();
    }
}

#[async_trait]
impl HistoryManager for MemoryHistoryManager {
    async fn add(
        &self,
        channel: &Channel,
        data: Bytes,
        info: Option<ClientInfo>,
        tags: Option<BTreeMap<String, String>>,
    ) -> Result<Publication, HistoryError> {
        let channels = self.channels.read();
        let log = if let Some(log) = channels.get(channel) {
            log
        } else {
            drop(channels);
            self.channels.write().entry(channel.clone()).or_insert_with(|| Mutex::new(ChannelLog::fresh()));
            return Box::pin(self.add(channel, data, info, tags)).await;
        };
        let mut log = log.lock();
        if log.expired(self.ttl) {
            *log = ChannelLog::fresh();
        }
        log.next_offset += 1;
        log.last_touched = Instant::now();
        let mut publication = Publication::transient(data);
        publication.offset = log.next_offset;
        publication.epoch = log.epoch;
        if let Some(info) = info {
            publication = publication.with_info(info);
        }
        if let Some(tags) = tags {
            publication = publication.with_tags(tags);
        }
        log.items.push_back(publication.clone());
        if log.items.len() > self.size {
            log.items.pop_front();
        }
        Ok(publication)
    }

    async fn get(
        &self,
        channel: &Channel,
        since: Option<StreamPosition>,
        limit: Option<u32>,
        reverse: bool,
    ) -> Result<(Vec<Publication>, StreamPosition), HistoryError> {
        if let Some(limit) = limit {
            if limit > self.max_limit {
                return Err(HistoryError::LimitExceeded(limit, self.max_limit));
            }
        }
        let channels = self.channels.read();
        let Some(log) = channels.get(channel) else {
            return Ok((Vec::new(), StreamPosition::ZERO));
        };
        let mut log = log.lock();
        if log.expired(self.ttl) {
            *log = ChannelLog::fresh();
            return Ok((Vec::new(), log.position()));
        }
        let since_offset = since.map(|s| s.offset).unwrap_or(0);
        let mut items: Vec<Publication> = log
            .items
            .iter()
            .filter(|p| p.offset > since_offset)
            .cloned()
            .collect();
        if reverse {
            items.reverse();
        }
        if let Some(limit) = limit {
            items.truncate(limit as usize);
        }
        Ok((items, log.position()))
    }

    async fn current_position(&self, channel: &Channel) -> Result<StreamPosition, HistoryError> {
        let channels = self.channels.read();
        match channels.get(channel) {
            Some(log) => Ok(log.lock().position()),
            None => Ok(StreamPosition::ZERO),
        }
    }

    async fn remove_channel(&self, channel: &Channel) -> Result<(), HistoryError> {
        self.channels.write().remove(channel);
        Ok(())
    }

    async fn close(&self) {
        self.abort_sweep();
    }
}

struct PresenceEntry {
    info: ClientInfo,
    expires_at: Instant,
}

struct ChannelPresence {
    clients: HashMap<ClientId, PresenceEntry>,
    user_refcounts: Option<HashMap<UserId, u64>>,
}

impl ChannelPresence {
    fn new(user_mapping: bool) -> Self {
        Self {
            clients: HashMap::new(),
            user_refcounts: user_mapping.then(HashMap::new),
        }
    }

    fn sweep(&mut self, now: Instant) {
        let expired: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for client_id in expired {
            self.remove(client_id);
        }
    }

    fn remove(&mut self, client_id: ClientId) {
        if let Some(entry) = self.clients.remove(&client_id) {
            if let Some(refcounts) = &mut self.user_refcounts {
                if let Some(count) = refcounts.get_mut(&entry.info.user_id) {
                    *count -= 1;
                    if *count == 0 {
                        refcounts.remove(&entry.info.user_id);
                    }
                }
            }
        }
    }
}

/// Presence backed by per-channel maps with a lazy sweep on every read plus
/// a periodic background pass, so a channel nobody queries still releases
/// its memory once its last client's TTL lapses (spec §9's resolution: no
/// hash-field-TTL primitive exists to delegate to in-process, so presence
/// expiry is swept rather than pushed).
pub struct MemoryPresenceManager {
    channels: RwLock<HashMap<Channel, Mutex<ChannelPresence>>>,
    ttl: Duration,
    user_mapping: bool,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryPresenceManager {
    pub fn new(ttl: Duration, refresh_interval: Duration, user_mapping: bool) -> Arc<Self> {
        let this = Arc::new(Self {
            channels: RwLock::new(HashMap::new()),
            ttl,
            user_mapping,
            sweep_task: Mutex::new(None),
        });
        let sweep_target = this.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(refresh_interval);
            loop {
                interval.tick().await;
                let now = Instant::now();
                let mut channels = sweep_target.channels.write();
                channels.retain(|_, presence| {
                    presence.lock().sweep(now);
                    !presence.lock().clients.is_empty()
                });
            }
        });
        *this.sweep_task.lock() = Some(handle);
        this
    }
}

impl MemoryPresenceManager {
    fn abort_sweep(&self) {
        if let Some(handle) = self.sweep_task.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for MemoryPresenceManager {
    fn drop(&mut self) {
        self.abort_sweep();
    }
}

#[async_trait]
impl PresenceManager for MemoryPresenceManager {
    async fn add(&self, channel: &Channel, info: ClientInfo) -> Result<(), PresenceError> {
        let channels = self.channels.read();
        let presence = if let Some(presence) = channels.get(channel) {
            presence
        } else {
            drop(channels);
            self.channels
                .write()
                .entry(channel.clone())
                .or_insert_with(|| Mutex::new(ChannelPresence::new(self.user_mapping)));
            return Box::pin(self.add(channel, info)).await;
        };
        let mut presence = presence.lock();
        let now = Instant::now();
        presence.sweep(now);
        let client_id = info.client_id;
        let user_id = info.user_id.clone();
        let is_new = !presence.clients.contains_key(&client_id);
        presence.clients.insert(
            client_id,
            PresenceEntry {
                info,
                expires_at: now + self.ttl,
            },
        );
        if is_new {
            if let Some(refcounts) = &mut presence.user_refcounts {
                *refcounts.entry(user_id).or_insert(0) += 1;
            }
        }
        Ok(())
    }

    async fn remove(&self, channel: &Channel, client_id: ClientId) -> Result<(), PresenceError> {
        if let Some(presence) = self.channels.read().get(channel) {
            presence.lock().remove(client_id);
        }
        Ok(())
    }

    async fn get(&self, channel: &Channel) -> Result<BTreeMap<ClientId, ClientInfo>, PresenceError> {
        let Some(presence) = self.channels.read().get(channel).map(|p| {
            let mut p = p.lock();
            p.sweep(Instant::now());
            p.clients.iter().map(|(id, e)| (*id, e.info.clone())).collect::<BTreeMap<_, _>>()
        }) else {
            return Ok(BTreeMap::new());
        };
        Ok(presence)
    }

    async fn stats(&self, channel: &Channel) -> Result<PresenceStats, PresenceError> {
        let Some((num_clients, num_users)) = self.channels.read().get(channel).map(|p| {
            let mut p = p.lock();
            p.sweep(Instant::now());
            let num_clients = p.clients.len() as u64;
            let num_users = match &p.user_refcounts {
                Some(refcounts) => refcounts.len() as u64,
                None => p.clients.values().map(|e| &e.info.user_id).collect::<std::collections::HashSet<_>>().len() as u64,
            };
            (num_clients, num_users)
        }) else {
            return Ok(PresenceStats::default());
        };
        Ok(PresenceStats { num_clients, num_users })
    }

    async fn close(&self) {
        self.abort_sweep();
    }
}
