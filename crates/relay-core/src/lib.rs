use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

pub mod wire;

/// Watch key that subscribes a dashboard to every agent.
pub const WATCH_ALL: &str = "all";

/// Subscription scope of a dashboard connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchKey {
    All,
    Client(String),
}

impl WatchKey {
    /// Absent, blank and `"all"` all mean every agent.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") => WatchKey::All,
            Some(value) if value.eq_ignore_ascii_case(WATCH_ALL) => WatchKey::All,
            Some(value) => WatchKey::Client(value.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            WatchKey::All => WATCH_ALL,
            WatchKey::Client(client_id) => client_id,
        }
    }

    pub fn client_id(&self) -> Option<&str> {
        match self {
            WatchKey::All => None,
            WatchKey::Client(client_id) => Some(client_id),
        }
    }
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Most recent image captured by one camera of one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    #[serde(rename = "cliente_id", alias = "client_id")]
    pub client_id: String,
    pub camera_id: String,
    /// Capture time, unix millis.
    pub timestamp: i64,
    #[serde(with = "image_base64")]
    pub image: Vec<u8>,
    pub content_type: String,
}

impl SnapshotRecord {
    pub fn meta(&self) -> SnapshotMeta {
        SnapshotMeta {
            client_id: self.client_id.clone(),
            camera_id: self.camera_id.clone(),
            timestamp: self.timestamp,
            content_type: self.content_type.clone(),
            size: self.image.len(),
        }
    }
}

/// Snapshot listing entry without the image bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    #[serde(rename = "cliente_id")]
    pub client_id: String,
    pub camera_id: String,
    pub timestamp: i64,
    pub content_type: String,
    pub size: usize,
}

/// Public view of a connected agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSummary {
    #[serde(rename = "cliente_id")]
    pub client_id: String,
    pub info: Value,
    /// Unix millis of the last auth, status update or heartbeat.
    pub last_seen: i64,
    pub connected_at: i64,
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Accepts identifiers sent either as strings or as bare numbers (camera channels).
pub(crate) fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

mod image_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.trim().as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_key_defaults_to_all() {
        assert_eq!(WatchKey::parse(None), WatchKey::All);
        assert_eq!(WatchKey::parse(Some("  ")), WatchKey::All);
        assert_eq!(WatchKey::parse(Some("ALL")), WatchKey::All);
        assert_eq!(
            WatchKey::parse(Some(" acme ")),
            WatchKey::Client("acme".to_string())
        );
        assert_eq!(WatchKey::Client("acme".to_string()).client_id(), Some("acme"));
    }

    #[test]
    fn snapshot_record_carries_image_as_base64() {
        let record = SnapshotRecord {
            client_id: "acme".to_string(),
            camera_id: "cam-1".to_string(),
            timestamp: 1_707_335_222_222,
            image: vec![0xff, 0xd8, 0xff, 0xe0],
            content_type: "image/jpeg".to_string(),
        };
        let value = serde_json::to_value(&record).expect("serialize");
        assert_eq!(value["cliente_id"], "acme");
        assert_eq!(value["image"], "/9j/4A==");

        let back: SnapshotRecord = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, record);
        assert_eq!(back.meta().size, 4);
    }
}
