//! Configuration surface (spec §6), built as a plain struct with a
//! `Default` impl holding the documented defaults, the way the teacher's
//! `ClientConfig` (`client_connection.rs`) is constructed (`for_test()`
//! there plays the role of our `Default`/builder methods here).

use std::time::Duration;

use signalhub_messages::Channel;

/// Per-channel batching policy for [`crate::batch::PerChannelWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBatchConfig {
    /// Flush immediately once this many items are buffered. `0` disables
    /// the size trigger (delay-only batching).
    pub max_size: usize,
    /// Flush this long after the first item in an empty buffer, if the size
    /// trigger hasn't fired first.
    pub max_delay: Duration,
    /// If true, `Add` replaces the buffer instead of appending: only the
    /// most recent item survives to the next flush.
    pub flush_latest: bool,
}

impl Default for ChannelBatchConfig {
    fn default() -> Self {
        Self {
            max_size: 0,
            max_delay: Duration::from_millis(0),
            flush_latest: false,
        }
    }
}

impl ChannelBatchConfig {
    /// Flush every item immediately, preserving order but issuing one frame
    /// per publication. The degenerate case named in spec §4.3.
    pub fn unbatched() -> Self {
        Self {
            max_size: 1,
            max_delay: Duration::ZERO,
            flush_latest: false,
        }
    }

    pub fn by_delay(max_delay: Duration) -> Self {
        Self {
            max_size: 0,
            max_delay,
            flush_latest: false,
        }
    }

    pub fn by_size(max_size: usize) -> Self {
        Self {
            max_size,
            max_delay: Duration::from_secs(1),
            flush_latest: false,
        }
    }

    pub fn latest_only(max_size: usize) -> Self {
        Self {
            max_size,
            max_delay: Duration::from_millis(0),
            flush_latest: true,
        }
    }
}

/// Process-wide configuration for a [`crate::node::Node`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_name: String,
    pub version: String,

    pub client_ping_interval: Duration,
    pub client_message_write_timeout: Duration,
    pub client_queue_max_size: usize,
    pub client_request_max_size: usize,
    pub client_stale_close_delay: Duration,
    pub client_expired_close_delay: Duration,
    pub client_connect_timeout: Duration,

    pub channel_max_length: usize,

    pub history_size: usize,
    pub history_ttl: Duration,

    pub presence_ttl: Duration,
    pub presence_refresh_interval: Duration,
    /// Whether the in-memory presence manager tracks a distinct user-id set
    /// per channel for O(1) `NumUsers`, per §9's user-mapping open question.
    pub presence_user_mapping: bool,

    pub node_info_publish_interval: Duration,

    /// Default batching policy, consulted by `GetChannelBatchConfig` when no
    /// channel-specific override is registered.
    default_batch_config: ChannelBatchConfig,
    channel_batch_overrides: hashbrown::HashMap<Channel, ChannelBatchConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "signalhub".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),

            client_ping_interval: Duration::from_secs(25),
            client_message_write_timeout: Duration::from_secs(1),
            client_queue_max_size: 64 * 1024,
            client_request_max_size: 64 * 1024,
            client_stale_close_delay: Duration::from_secs(25),
            client_expired_close_delay: Duration::from_secs(25),
            client_connect_timeout: Duration::from_secs(1),

            channel_max_length: 255,

            history_size: 100,
            history_ttl: Duration::from_secs(5 * 60),

            presence_ttl: Duration::from_secs(30),
            presence_refresh_interval: Duration::from_secs(25),
            presence_user_mapping: true,

            node_info_publish_interval: Duration::from_secs(3),

            default_batch_config: ChannelBatchConfig::default(),
            channel_batch_overrides: hashbrown::HashMap::new(),
        }
    }
}

impl NodeConfig {
    pub fn with_default_batch_config(mut self, config: ChannelBatchConfig) -> Self {
        self.default_batch_config = config;
        self
    }

    pub fn with_channel_batch_config(mut self, channel: Channel, config: ChannelBatchConfig) -> Self {
        self.channel_batch_overrides.insert(channel, config);
        self
    }

    /// `GetChannelBatchConfig(channel)` from spec §6.
    pub fn channel_batch_config(&self, channel: &Channel) -> ChannelBatchConfig {
        self.channel_batch_overrides
            .get(channel)
            .copied()
            .unwrap_or(self.default_batch_config)
    }
}
