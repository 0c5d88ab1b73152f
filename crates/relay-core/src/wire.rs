use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::{deserialize_id, now_ms, SnapshotRecord, WatchKey};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;
pub const DEFAULT_CONTENT_TYPE: &str = "image/jpeg";
const REQUEST_ID_SUFFIX_LEN: usize = 9;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("frame carries no action or type")]
    MissingDiscriminant,
    #[error("invalid {action} payload: {reason}")]
    InvalidPayload { action: String, reason: String },
    #[error("frame encode failed: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuthPayload {
    #[serde(rename = "cliente_id", alias = "client_id")]
    pub client_id: String,
    #[serde(default)]
    pub info: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RegisterDashboardPayload {
    #[serde(default, rename = "cliente_id", alias = "client_id", alias = "watch")]
    pub client_id: Option<String>,
}

impl RegisterDashboardPayload {
    pub fn watch_key(&self) -> WatchKey {
        WatchKey::parse(self.client_id.as_deref())
    }
}

/// Body of `status_update` and application-level `pong`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub info: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CameraSnapshotPayload {
    #[serde(alias = "camera", deserialize_with = "deserialize_id")]
    pub camera_id: String,
    #[serde(alias = "snapshot")]
    pub image: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl CameraSnapshotPayload {
    pub fn into_record(self, client_id: &str) -> Result<SnapshotRecord, FrameError> {
        if self.camera_id.trim().is_empty() {
            return Err(invalid("camera_snapshot", "missing camera_id"));
        }
        let (uri_type, encoded) = split_data_uri(self.image.trim());
        let image = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|err| invalid("camera_snapshot", &format!("image is not base64: {err}")))?;
        let content_type = self
            .content_type
            .filter(|value| !value.trim().is_empty())
            .or(uri_type)
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        Ok(SnapshotRecord {
            client_id: client_id.to_string(),
            camera_id: self.camera_id,
            timestamp: self.timestamp.unwrap_or_else(now_ms),
            image,
            content_type,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PingPayload {
    #[serde(default)]
    pub timestamp: Value,
}

/// Inbound frame classified by its `action` (or `type`) discriminant.
///
/// Anything the broker does not know lands in `Unrecognized` and is left
/// alone by the router, so newer agents can speak actions this build ignores.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Auth(AuthPayload),
    RegisterDashboard(RegisterDashboardPayload),
    StatusUpdate(HeartbeatPayload),
    Pong(HeartbeatPayload),
    CameraSnapshot(CameraSnapshotPayload),
    Ping(PingPayload),
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub discriminant: String,
    pub request_id: Option<String>,
    pub msg: Inbound,
    pub raw: Map<String, Value>,
}

pub fn decode_inbound(bytes: &[u8], max_frame_bytes: usize) -> Result<InboundFrame, FrameError> {
    if bytes.len() > max_frame_bytes {
        return Err(FrameError::Oversized {
            size: bytes.len(),
            max: max_frame_bytes,
        });
    }
    let value: Value =
        serde_json::from_slice(bytes).map_err(|err| FrameError::Decode(err.to_string()))?;
    let Value::Object(raw) = value else {
        return Err(FrameError::Decode("frame is not a JSON object".to_string()));
    };
    let discriminant = discriminant_of(&raw).ok_or(FrameError::MissingDiscriminant)?;
    let request_id = raw.get("request_id").and_then(request_id_of);

    let msg = match discriminant.as_str() {
        "auth" => {
            let payload: AuthPayload = parse_payload(&raw, "auth")?;
            if payload.client_id.trim().is_empty() {
                return Err(invalid("auth", "missing cliente_id"));
            }
            Inbound::Auth(AuthPayload {
                client_id: payload.client_id.trim().to_string(),
                info: payload.info,
            })
        }
        "register_dashboard" => {
            Inbound::RegisterDashboard(parse_payload(&raw, "register_dashboard")?)
        }
        "status_update" => Inbound::StatusUpdate(parse_payload(&raw, "status_update")?),
        "pong" => Inbound::Pong(parse_payload(&raw, "pong")?),
        "camera_snapshot" => Inbound::CameraSnapshot(parse_payload(&raw, "camera_snapshot")?),
        "ping" => Inbound::Ping(parse_payload(&raw, "ping")?),
        _ => Inbound::Unrecognized,
    };

    Ok(InboundFrame {
        discriminant,
        request_id,
        msg,
        raw,
    })
}

/// Frames the broker emits towards agents and dashboards.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Outbound {
    Welcome {
        message: String,
        clients: usize,
    },
    AuthSuccess {
        message: String,
    },
    DashboardRegistered {
        watch: String,
        clients: usize,
    },
    ClientConnected {
        #[serde(rename = "cliente_id")]
        client_id: String,
        info: Value,
        clients: usize,
    },
    ClientDisconnected {
        #[serde(rename = "cliente_id")]
        client_id: String,
        clients: usize,
    },
    StatusUpdate {
        #[serde(rename = "cliente_id")]
        client_id: String,
        info: Value,
        last_seen: i64,
    },
    CameraSnapshot(SnapshotRecord),
    ServerShutdown {
        message: String,
    },
}

/// Reply to a dashboard latency probe; uses `type` like the probe itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PongReply {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: Value,
    pub clients: usize,
}

impl PongReply {
    pub fn new(timestamp: Value, clients: usize) -> Self {
        Self {
            kind: "pong",
            timestamp,
            clients,
        }
    }
}

pub fn encode_frame<T: Serialize>(value: &T) -> Result<String, FrameError> {
    serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))
}

/// Copy of an agent frame tagged with the agent it came from, for dashboards.
pub fn with_client_id(raw: &Map<String, Value>, client_id: &str) -> Map<String, Value> {
    let mut stamped = raw.clone();
    stamped.insert(
        "cliente_id".to_string(),
        Value::String(client_id.to_string()),
    );
    stamped
}

/// `req_<unix-millis>_<9 lowercase alphanumerics>`.
pub fn new_request_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("req_{}_{}", now_ms(), &suffix[..REQUEST_ID_SUFFIX_LEN])
}

fn discriminant_of(raw: &Map<String, Value>) -> Option<String> {
    ["action", "type"].iter().find_map(|key| {
        raw.get(*key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    })
}

/// Request ids travel as strings or bare numbers; both map to the same key.
pub fn request_id_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_payload<T: DeserializeOwned>(
    raw: &Map<String, Value>,
    action: &str,
) -> Result<T, FrameError> {
    serde_json::from_value(Value::Object(raw.clone()))
        .map_err(|err| invalid(action, &err.to_string()))
}

fn invalid(action: &str, reason: &str) -> FrameError {
    FrameError::InvalidPayload {
        action: action.to_string(),
        reason: reason.to_string(),
    }
}

/// Splits `data:image/png;base64,....` into its media type and payload.
fn split_data_uri(image: &str) -> (Option<String>, &str) {
    let Some(rest) = image.strip_prefix("data:") else {
        return (None, image);
    };
    match rest.split_once(',') {
        Some((header, body)) => {
            let media = header.trim_end_matches(";base64");
            let media = (!media.is_empty()).then(|| media.to_string());
            (media, body)
        }
        None => (None, image),
    }
}
