//! Session record type (spec.md §3 "Session record").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque connection-identity bytes assigned by the Router/Dealer
/// transport, stable for the life of one dealer connection.
pub type ConnectionIdentity = Vec<u8>;

/// `{sessionId, containerId, group, connectionIdentity, startedAt}`. The
/// sole holder of the `connectionIdentity -> group` binding; a lost session
/// means responses for that connection can no longer be routed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub container_id: String,
    pub group: String,
    #[serde(with = "hex_bytes")]
    pub connection_identity: ConnectionIdentity,
    pub started_at: DateTime<Utc>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
