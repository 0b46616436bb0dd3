use bytes::Bytes;

/// Per-connection identifier, generated by the server when a session is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub uuid::Uuid);

impl ClientId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// User identifier supplied by the credentials hook. Empty means anonymous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct UserId(pub bytestring::ByteString);

impl UserId {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_anonymous(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

/// Identity + free-form connection/channel metadata attached to a subscriber,
/// as returned by presence lookups and carried on publications that were
/// produced by a client publish.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub user_id: UserId,
    /// Opaque per-connection metadata supplied at `Connect` time.
    #[serde(with = "serde_bytes_as_base64", default)]
    pub conn_info: Bytes,
    /// Opaque per-subscription metadata supplied at `Subscribe` time.
    #[serde(with = "serde_bytes_as_base64", default)]
    pub chan_info: Bytes,
}

impl ClientInfo {
    pub fn new(client_id: ClientId, user_id: UserId) -> Self {
        Self {
            client_id,
            user_id,
            conn_info: Bytes::new(),
            chan_info: Bytes::new(),
        }
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
