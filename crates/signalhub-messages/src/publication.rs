use std::collections::BTreeMap;

use bytes::Bytes;

use crate::client_info::ClientInfo;

/// A point in a recoverable channel's history: an offset within an epoch.
///
/// The epoch changes whenever the underlying history ring is discarded (for
/// example on TTL expiry), signalling to a resubscribing client that its
/// remembered offset is no longer meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct StreamPosition {
    pub offset: u64,
    pub epoch: u64,
}

impl StreamPosition {
    pub const ZERO: Self = Self { offset: 0, epoch: 0 };

    pub fn same_epoch(&self, other: &Self) -> bool {
        self.epoch == other.epoch
    }
}

/// One message published to a channel.
///
/// `offset` is zero for non-recoverable channels (no history configured);
/// otherwise it is assigned by the broker/history manager and is immutable
/// once issued.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Publication {
    pub offset: u64,
    pub epoch: u64,
    #[serde(with = "serde_bytes_as_base64")]
    pub data: Bytes,
    pub info: Option<ClientInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
}

impl Publication {
    /// Construct a non-recoverable publication (offset/epoch both zero).
    pub fn transient(data: impl Into<Bytes>) -> Self {
        Self {
            offset: 0,
            epoch: 0,
            data: data.into(),
            info: None,
            tags: None,
        }
    }

    pub fn position(&self) -> StreamPosition {
        StreamPosition {
            offset: self.offset,
            epoch: self.epoch,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.offset != 0
    }

    pub fn with_info(mut self, info: ClientInfo) -> Self {
        self.info = Some(info);
        self
    }

    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = Some(tags);
        self
    }
}

mod serde_bytes_as_base64 {
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
