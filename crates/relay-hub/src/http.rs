use axum::{
    body::Bytes,
    extract::{ws::WebSocketUpgrade, ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use relay_core::now_ms;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

use crate::{
    broker::Broker,
    error::BrokerError,
    ws::{run_session, SessionSettings},
};

const SERVICE_NAME: &str = "relay-hub";

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    pub session: SessionSettings,
    pub request_timeout: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/clients", get(clients))
        .route("/status/:cliente_id", get(status))
        .route("/command/:cliente_id", post(command))
        .route("/request/:cliente_id", post(request))
        .route("/snapshot/:cliente_id/:camera_id", get(snapshot))
        .route("/snapshots/:cliente_id", get(snapshots))
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
}

/// Agents connect on `/`; plain GETs get the service banner.
async fn root(
    ws: Option<WebSocketUpgrade>,
    connect: Option<ConnectInfo<SocketAddr>>,
    State(state): State<AppState>,
) -> Response {
    if let Some(ws) = ws {
        return upgrade(ws, connect.map(|ConnectInfo(addr)| addr), state);
    }
    Json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "clients": state.broker.agent_count().await,
        "timestamp": now_ms(),
    }))
    .into_response()
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    connect: Option<ConnectInfo<SocketAddr>>,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, connect.map(|ConnectInfo(addr)| addr), state)
}

fn upgrade(ws: WebSocketUpgrade, remote: Option<SocketAddr>, state: AppState) -> Response {
    let AppState {
        broker, session, ..
    } = state;
    ws.on_upgrade(move |socket| run_session(broker, socket, remote, session))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let broker = &state.broker;
    Json(json!({
        "status": "ok",
        "clients": broker.agent_count().await,
        "dashboards": broker.dashboard_count().await,
        "snapshots": broker.snapshot_count().await,
        "pending_requests": broker.pending().len(),
        "timestamp": now_ms(),
    }))
}

async fn clients(State(state): State<AppState>) -> Json<Value> {
    let clients = state.broker.list_clients().await;
    let total = clients.len();
    Json(json!({ "clients": clients, "total": total }))
}

async fn status(Path(client_id): Path<String>, State(state): State<AppState>) -> Json<Value> {
    let body = match state.broker.client(&client_id).await {
        Some(summary) => json!({
            "cliente_id": client_id,
            "online": true,
            "info": summary.info,
            "last_seen": summary.last_seen,
            "timestamp": now_ms(),
        }),
        None => json!({
            "cliente_id": client_id,
            "online": false,
            "info": null,
            "last_seen": null,
            "timestamp": now_ms(),
        }),
    };
    Json(body)
}

async fn command(
    Path(client_id): Path<String>,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, BrokerError> {
    let message = parse_command(&body)?;
    let request_id = state.broker.send(&client_id, message).await?;
    Ok(Json(json!({ "success": true, "request_id": request_id })))
}

#[derive(Debug, Default, Deserialize)]
struct RequestParams {
    timeout_ms: Option<u64>,
}

async fn request(
    Path(client_id): Path<String>,
    Query(params): Query<RequestParams>,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, BrokerError> {
    let message = parse_command(&body)?;
    let timeout = params
        .timeout_ms
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(state.request_timeout);
    let (request_id, data) = state
        .broker
        .send_and_await(&client_id, message, timeout)
        .await?;
    Ok(Json(json!({
        "success": true,
        "request_id": request_id,
        "data": data,
    })))
}

async fn snapshot(
    Path((client_id, camera_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Response {
    let Some(record) = state.broker.get_snapshot(&client_id, &camera_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "snapshot not found",
                "cliente_id": client_id,
                "camera_id": camera_id,
            })),
        )
            .into_response();
    };
    let mut headers = HeaderMap::new();
    let content_type = HeaderValue::from_str(&record.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(
        "x-snapshot-timestamp",
        HeaderValue::from(record.timestamp),
    );
    (headers, record.image).into_response()
}

async fn snapshots(Path(client_id): Path<String>, State(state): State<AppState>) -> Json<Value> {
    let snapshots = state.broker.list_snapshots(&client_id).await;
    let total = snapshots.len();
    Json(json!({
        "cliente_id": client_id,
        "snapshots": snapshots,
        "total": total,
    }))
}

/// An empty body is an empty command object; anything else must be a JSON object.
fn parse_command(body: &[u8]) -> Result<Value, BrokerError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }
    let value: Value = serde_json::from_slice(body).map_err(|err| {
        debug!(event = "command_body_invalid", error = %err);
        BrokerError::InvalidCommand(err.to_string())
    })?;
    if !value.is_object() {
        return Err(BrokerError::InvalidCommand(
            "command body must be a JSON object".to_string(),
        ));
    }
    Ok(value)
}
