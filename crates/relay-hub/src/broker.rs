use relay_core::{
    wire::{
        decode_inbound, encode_frame, new_request_id, request_id_of, with_client_id,
        AuthPayload, CameraSnapshotPayload, HeartbeatPayload, Inbound, Outbound, PongReply,
        DEFAULT_MAX_FRAME_BYTES,
    },
    ClientSummary, SnapshotMeta, SnapshotRecord, WatchKey,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::{
    correlation::CorrelationTable,
    error::BrokerError,
    registry::{ConnectionRegistry, Transport},
    snapshots::SnapshotCache,
};

const DEBUG_PREVIEW_BYTES: usize = 512;
const SERVICE_NAME: &str = "relay-hub";

#[derive(Clone, Debug)]
pub struct RouterSettings {
    pub max_frame_bytes: usize,
    pub debug: bool,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            debug: false,
        }
    }
}

/// Rendezvous between agents, dashboards and HTTP callers.
///
/// The registries are handed in at construction so every broker (and every
/// test) owns its own state.
pub struct Broker {
    settings: RouterSettings,
    conn_counter: AtomicU64,
    registry: ConnectionRegistry,
    snapshots: SnapshotCache,
    pending: Arc<CorrelationTable>,
}

impl Broker {
    pub fn new(
        settings: RouterSettings,
        registry: ConnectionRegistry,
        snapshots: SnapshotCache,
        pending: Arc<CorrelationTable>,
    ) -> Self {
        Self {
            settings,
            conn_counter: AtomicU64::new(0),
            registry,
            snapshots,
            pending,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn pending(&self) -> &CorrelationTable {
        &self.pending
    }

    pub fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    /// Tracks a fresh connection and greets it.
    pub async fn open_connection(&self, transport: &Arc<Transport>) {
        self.registry.attach(transport.clone()).await;
        let welcome = Outbound::Welcome {
            message: format!("connected to {SERVICE_NAME}"),
            clients: self.registry.agent_count().await,
        };
        self.send_frame(transport, &welcome);
        info!(event = "connection_opened", conn_id = %transport.conn_id());
    }

    /// Single teardown path for natural closes, forced closes and sweeper kills.
    /// Safe to call more than once per transport.
    pub async fn teardown(&self, transport: &Arc<Transport>, reason: &str) {
        let attached = self.registry.detach(transport.conn_id()).await;
        self.registry.remove_dashboard(transport).await;
        if let Some(client_id) = self.registry.remove_agent(transport).await {
            self.pending.fail_for_client(&client_id);
            self.announce_disconnect(&client_id).await;
        }
        if attached {
            info!(event = "connection_closed", conn_id = %transport.conn_id(), reason = reason);
        }
    }

    pub async fn route(&self, transport: &Arc<Transport>, raw: &[u8]) {
        if self.settings.debug {
            debug!(
                event = "frame_received",
                conn_id = %transport.conn_id(),
                raw = %preview(raw)
            );
        }
        let frame = match decode_inbound(raw, self.settings.max_frame_bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = "frame_dropped", conn_id = %transport.conn_id(), error = %err);
                return;
            }
        };

        let forward = matches!(frame.msg, Inbound::Unrecognized);
        match frame.msg {
            Inbound::Auth(payload) => self.handle_auth(transport, payload).await,
            Inbound::RegisterDashboard(payload) => {
                self.handle_register_dashboard(transport, payload.watch_key())
                    .await
            }
            Inbound::StatusUpdate(payload) | Inbound::Pong(payload) => {
                self.handle_heartbeat(transport, &frame.discriminant, payload)
                    .await
            }
            Inbound::CameraSnapshot(payload) => self.handle_snapshot(transport, payload).await,
            Inbound::Ping(payload) => {
                let reply = PongReply::new(payload.timestamp, self.registry.agent_count().await);
                self.send_frame(transport, &reply);
            }
            Inbound::Unrecognized => {
                if frame.request_id.is_none() {
                    debug!(
                        event = "frame_ignored",
                        conn_id = %transport.conn_id(),
                        action = %frame.discriminant
                    );
                }
            }
        }

        if let Some(request_id) = frame.request_id.as_deref() {
            self.handle_reply(
                transport,
                request_id,
                &frame.discriminant,
                &frame.raw,
                forward,
            )
            .await;
        }
    }

    async fn handle_auth(&self, transport: &Arc<Transport>, payload: AuthPayload) {
        let AuthPayload { client_id, info } = payload;
        let info = info.unwrap_or_else(|| Value::Object(Map::new()));
        let registration = self
            .registry
            .register_agent(&client_id, transport.clone(), info.clone())
            .await;

        if let Some(previous) = registration.released {
            self.pending.fail_for_client(&previous);
            self.announce_disconnect(&previous).await;
        }
        if let Some(stale) = registration.superseded {
            warn!(
                event = "agent_superseded",
                client_id = %client_id,
                stale_conn = %stale.conn_id(),
                conn_id = %transport.conn_id()
            );
            stale.close("superseded");
        }

        info!(
            event = "agent_authenticated",
            client_id = %client_id,
            conn_id = %transport.conn_id()
        );
        self.send_frame(
            transport,
            &Outbound::AuthSuccess {
                message: "authenticated".to_string(),
            },
        );
        let event = Outbound::ClientConnected {
            client_id: client_id.clone(),
            info,
            clients: self.registry.agent_count().await,
        };
        self.broadcast(&client_id, &event).await;
    }

    async fn handle_register_dashboard(&self, transport: &Arc<Transport>, watch: WatchKey) {
        self.registry
            .register_dashboard(transport.clone(), watch.clone())
            .await;
        self.send_frame(
            transport,
            &Outbound::DashboardRegistered {
                watch: watch.to_string(),
                clients: self.registry.agent_count().await,
            },
        );

        let Some(client_id) = watch.client_id() else {
            return;
        };
        let cached = self.snapshots.list_for_client(client_id).await;
        let count = cached.len();
        for record in cached {
            if !self.send_frame(transport, &Outbound::CameraSnapshot(record)) {
                warn!(event = "snapshot_replay_error", conn_id = %transport.conn_id());
                return;
            }
        }
        if count > 0 {
            info!(
                event = "snapshot_replayed",
                conn_id = %transport.conn_id(),
                client_id = client_id,
                count = count
            );
        }
    }

    async fn handle_heartbeat(
        &self,
        transport: &Arc<Transport>,
        action: &str,
        payload: HeartbeatPayload,
    ) {
        let Some(client_id) = self.registry.client_for(transport.conn_id()).await else {
            debug!(
                event = "heartbeat_unauthenticated",
                conn_id = %transport.conn_id(),
                action = action
            );
            return;
        };
        let Some(agent) = self.registry.touch_agent(&client_id, payload.info).await else {
            return;
        };
        let event = Outbound::StatusUpdate {
            client_id: client_id.clone(),
            info: agent.info,
            last_seen: agent.last_seen.timestamp_millis(),
        };
        self.broadcast(&client_id, &event).await;
    }

    async fn handle_snapshot(&self, transport: &Arc<Transport>, payload: CameraSnapshotPayload) {
        let Some(client_id) = self.registry.client_for(transport.conn_id()).await else {
            debug!(event = "snapshot_unauthenticated", conn_id = %transport.conn_id());
            return;
        };
        let record = match payload.into_record(&client_id) {
            Ok(record) => record,
            Err(err) => {
                warn!(event = "frame_dropped", conn_id = %transport.conn_id(), error = %err);
                return;
            }
        };
        self.snapshots.put(record.clone()).await;
        self.broadcast(&client_id, &Outbound::CameraSnapshot(record))
            .await;
    }

    /// Agent frames carrying a request id complete the matching caller. Untyped
    /// ones are also shown to the agent's dashboards; typed actions already
    /// broadcast through their own handler.
    async fn handle_reply(
        &self,
        transport: &Arc<Transport>,
        request_id: &str,
        action: &str,
        raw: &Map<String, Value>,
        forward: bool,
    ) {
        let Some(client_id) = self.registry.client_for(transport.conn_id()).await else {
            debug!(
                event = "reply_unauthenticated",
                conn_id = %transport.conn_id(),
                request_id = request_id
            );
            return;
        };
        let stamped = with_client_id(raw, &client_id);
        let resolved = self
            .pending
            .resolve_for(&client_id, request_id, Value::Object(stamped.clone()));
        debug!(
            event = "reply_received",
            client_id = %client_id,
            request_id = request_id,
            action = action,
            resolved = resolved
        );
        if forward {
            self.broadcast(&client_id, &stamped).await;
        }
    }

    async fn announce_disconnect(&self, client_id: &str) {
        let event = Outbound::ClientDisconnected {
            client_id: client_id.to_string(),
            clients: self.registry.agent_count().await,
        };
        self.broadcast(client_id, &event).await;
    }

    async fn broadcast<T: Serialize>(&self, client_id: &str, event: &T) {
        match encode_frame(event) {
            Ok(text) => {
                self.send_to_subscribers(client_id, &text).await;
            }
            Err(err) => warn!(event = "encode_error", error = %err),
        }
    }

    fn send_frame<T: Serialize>(&self, transport: &Transport, event: &T) -> bool {
        match encode_frame(event) {
            Ok(text) => transport.send_text(&text),
            Err(err) => {
                warn!(event = "encode_error", conn_id = %transport.conn_id(), error = %err);
                false
            }
        }
    }

    /// Delivers to dashboards watching `client_id` and those watching all.
    /// Closed destinations are skipped; returns how many accepted the frame.
    pub async fn send_to_subscribers(&self, client_id: &str, text: &str) -> usize {
        let targets = self.registry.subscribers(client_id).await;
        deliver(&targets, text)
    }

    /// Delivers to every dashboard regardless of watch key.
    pub async fn notify_all(&self, text: &str) -> usize {
        let targets = self.registry.all_dashboards().await;
        deliver(&targets, text)
    }

    /// Tells dashboards the broker is going away, then closes every connection.
    pub async fn shutdown(&self) {
        let notice = Outbound::ServerShutdown {
            message: "server shutting down".to_string(),
        };
        if let Ok(text) = encode_frame(&notice) {
            let notified = self.notify_all(&text).await;
            info!(event = "shutdown_notice", dashboards = notified);
        }
        for transport in self.registry.connections().await {
            transport.close("shutdown");
        }
    }

    pub async fn is_online(&self, client_id: &str) -> bool {
        self.registry.get(client_id).await.is_some()
    }

    /// Forwards a command to the agent without waiting for its answer.
    pub async fn send(&self, client_id: &str, message: Value) -> Result<String, BrokerError> {
        let (transport, request_id, text) = self.prepare_command(client_id, message).await?;
        if !transport.send_text(&text) {
            warn!(event = "command_send_failed", client_id = client_id, request_id = %request_id);
            return Err(BrokerError::AgentOffline {
                client_id: client_id.to_string(),
            });
        }
        info!(event = "command_forwarded", client_id = client_id, request_id = %request_id);
        Ok(request_id)
    }

    /// Forwards a command and waits for the agent frame carrying the same request id.
    pub async fn send_and_await(
        &self,
        client_id: &str,
        message: Value,
        timeout: Duration,
    ) -> Result<(String, Value), BrokerError> {
        let (transport, request_id, text) = self.prepare_command(client_id, message).await?;
        let pending = self.pending.open(&request_id, client_id, timeout)?;
        if !transport.send_text(&text) {
            warn!(event = "command_send_failed", client_id = client_id, request_id = %request_id);
            return Err(BrokerError::AgentOffline {
                client_id: client_id.to_string(),
            });
        }
        info!(event = "request_forwarded", client_id = client_id, request_id = %request_id);
        let payload = pending.wait().await?;
        Ok((request_id, payload))
    }

    async fn prepare_command(
        &self,
        client_id: &str,
        message: Value,
    ) -> Result<(Arc<Transport>, String, String), BrokerError> {
        let Value::Object(mut command) = message else {
            return Err(BrokerError::InvalidCommand(
                "command body must be a JSON object".to_string(),
            ));
        };
        let agent = self
            .registry
            .get(client_id)
            .await
            .ok_or_else(|| BrokerError::AgentOffline {
                client_id: client_id.to_string(),
            })?;
        // A caller-supplied id is forwarded as sent; agents echo it back verbatim.
        let request_id = match command.get("request_id").and_then(request_id_of) {
            Some(request_id) => request_id,
            None => {
                let request_id = new_request_id();
                command.insert("request_id".to_string(), Value::String(request_id.clone()));
                request_id
            }
        };
        let text = encode_frame(&command)?;
        Ok((agent.transport, request_id, text))
    }

    pub async fn list_clients(&self) -> Vec<ClientSummary> {
        self.registry.list().await
    }

    pub async fn client(&self, client_id: &str) -> Option<ClientSummary> {
        self.registry.get(client_id).await.map(|agent| agent.summary())
    }

    pub async fn agent_count(&self) -> usize {
        self.registry.agent_count().await
    }

    pub async fn dashboard_count(&self) -> usize {
        self.registry.dashboard_count().await
    }

    pub async fn snapshot_count(&self) -> usize {
        self.snapshots.len().await
    }

    pub async fn get_snapshot(&self, client_id: &str, camera_id: &str) -> Option<SnapshotRecord> {
        self.snapshots.get(client_id, camera_id).await
    }

    pub async fn list_snapshots(&self, client_id: &str) -> Vec<SnapshotMeta> {
        self.snapshots
            .list_for_client(client_id)
            .await
            .iter()
            .map(SnapshotRecord::meta)
            .collect()
    }
}

fn deliver(targets: &[Arc<Transport>], text: &str) -> usize {
    let mut delivered = 0;
    for target in targets {
        if target.send_text(text) {
            delivered += 1;
        } else {
            debug!(event = "broadcast_skip", conn_id = %target.conn_id());
        }
    }
    delivered
}

fn preview(raw: &[u8]) -> String {
    let end = raw.len().min(DEBUG_PREVIEW_BYTES);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::registry::tests::test_transport;
    use axum::extract::ws::Message;
    use serde_json::json;
    use tokio::sync::mpsc;

    pub(crate) fn test_broker() -> Arc<Broker> {
        Arc::new(Broker::new(
            RouterSettings::default(),
            ConnectionRegistry::new(),
            SnapshotCache::new(),
            Arc::new(CorrelationTable::new()),
        ))
    }

    pub(crate) async fn connect(
        broker: &Broker,
        conn_id: &str,
    ) -> (Arc<Transport>, mpsc::Receiver<Message>) {
        let (transport, mut rx) = test_transport(conn_id);
        broker.open_connection(&transport).await;
        let welcome = next_json(&mut rx).expect("welcome");
        assert_eq!(welcome["action"], "welcome");
        (transport, rx)
    }

    pub(crate) async fn send(broker: &Broker, transport: &Arc<Transport>, frame: Value) {
        let raw = serde_json::to_vec(&frame).expect("encode");
        broker.route(transport, &raw).await;
    }

    pub(crate) fn next_json(rx: &mut mpsc::Receiver<Message>) -> Option<Value> {
        loop {
            match rx.try_recv() {
                Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    pub(crate) fn drain_json(rx: &mut mpsc::Receiver<Message>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Some(frame) = next_json(rx) {
            frames.push(frame);
        }
        frames
    }

    type TestConn = (Arc<Transport>, mpsc::Receiver<Message>);

    fn event_keys(frames: Vec<Value>) -> Vec<String> {
        frames
            .into_iter()
            .map(|f| {
                let action = f["action"].as_str().unwrap_or_default();
                let client = f["cliente_id"].as_str().unwrap_or_default();
                format!("{action}:{client}")
            })
            .collect()
    }

    async fn auth(broker: &Broker, conn_id: &str, client_id: &str) -> TestConn {
        let (agent, mut rx) = connect(broker, conn_id).await;
        send(
            broker,
            &agent,
            json!({"action": "auth", "cliente_id": client_id, "info": {"hostname": conn_id}}),
        )
        .await;
        let reply = next_json(&mut rx).expect("auth reply");
        assert_eq!(reply["action"], "auth_success");
        (agent, rx)
    }

    async fn dashboard(broker: &Broker, conn_id: &str, watch: &str) -> TestConn {
        let (dash, mut rx) = connect(broker, conn_id).await;
        send(
            broker,
            &dash,
            json!({"action": "register_dashboard", "cliente_id": watch}),
        )
        .await;
        let ack = next_json(&mut rx).expect("dashboard ack");
        assert_eq!(ack["action"], "dashboard_registered");
        (dash, rx)
    }

    #[tokio::test]
    async fn auth_registers_agent_with_info() {
        let broker = test_broker();
        let (_agent, _rx) = auth(&broker, "conn-a", "acme").await;
        assert!(broker.is_online("acme").await);
        let summary = broker.client("acme").await.expect("summary");
        assert_eq!(summary.info, json!({"hostname": "conn-a"}));
    }

    #[tokio::test]
    async fn global_dashboard_sees_every_client_and_scoped_only_its_own() {
        let broker = test_broker();
        let (_all, mut all_rx) = dashboard(&broker, "dash-all", "all").await;
        let (_scoped, mut scoped_rx) = dashboard(&broker, "dash-x", "acme").await;

        let (acme, _acme_rx) = auth(&broker, "conn-a", "acme").await;
        let (globex, _globex_rx) = auth(&broker, "conn-b", "globex").await;
        broker.teardown(&acme, "test").await;
        broker.teardown(&globex, "test").await;

        let seen_all = event_keys(drain_json(&mut all_rx));
        assert_eq!(
            seen_all,
            vec![
                "client_connected:acme",
                "client_connected:globex",
                "client_disconnected:acme",
                "client_disconnected:globex",
            ]
        );

        let seen_scoped = event_keys(drain_json(&mut scoped_rx));
        assert_eq!(
            seen_scoped,
            vec!["client_connected:acme", "client_disconnected:acme"]
        );
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_are_dropped_quietly() {
        let broker = test_broker();
        let (agent, mut rx) = auth(&broker, "conn-a", "acme").await;
        broker.route(&agent, b"{not json").await;
        send(&broker, &agent, json!({"action": "from_the_future", "x": 1})).await;
        send(&broker, &agent, json!({"no": "discriminant"})).await;
        assert!(next_json(&mut rx).is_none());
        assert!(broker.is_online("acme").await);
    }

    #[tokio::test]
    async fn status_update_and_pong_refresh_agent_and_fan_out() {
        let broker = test_broker();
        let (_dash, mut dash_rx) = dashboard(&broker, "dash-x", "acme").await;
        let (agent, _rx) = auth(&broker, "conn-a", "acme").await;
        let _ = drain_json(&mut dash_rx);

        send(
            &broker,
            &agent,
            json!({"action": "status_update", "info": {"cameras": 4}}),
        )
        .await;
        let event = next_json(&mut dash_rx).expect("status broadcast");
        assert_eq!(event["action"], "status_update");
        assert_eq!(event["cliente_id"], "acme");
        assert_eq!(event["info"], json!({"cameras": 4}));

        send(&broker, &agent, json!({"action": "pong", "cliente_id": "acme"})).await;
        let event = next_json(&mut dash_rx).expect("pong broadcast");
        assert_eq!(event["action"], "status_update");
        assert_eq!(event["info"], json!({"cameras": 4}));
    }

    #[tokio::test]
    async fn heartbeat_from_unauthenticated_connection_is_ignored() {
        let broker = test_broker();
        let (_dash, mut dash_rx) = dashboard(&broker, "dash-all", "all").await;
        let (stranger, _rx) = connect(&broker, "conn-z").await;
        send(&broker, &stranger, json!({"action": "status_update", "info": {}})).await;
        assert!(next_json(&mut dash_rx).is_none());
    }

    #[tokio::test]
    async fn dashboard_ping_gets_pong_with_registry_size() {
        let broker = test_broker();
        let (_agent, _arx) = auth(&broker, "conn-a", "acme").await;
        let (dash, mut rx) = connect(&broker, "dash-1").await;
        send(&broker, &dash, json!({"type": "ping", "timestamp": 1234})).await;
        let pong = next_json(&mut rx).expect("pong");
        assert_eq!(pong, json!({"type": "pong", "timestamp": 1234, "clients": 1}));
    }

    #[tokio::test]
    async fn snapshots_are_cached_broadcast_and_replayed_to_new_watchers() {
        let broker = test_broker();
        let (_all, mut all_rx) = dashboard(&broker, "dash-all", "all").await;
        let (agent, _rx) = auth(&broker, "conn-a", "acme").await;
        let _ = drain_json(&mut all_rx);

        for image in ["AQID", "BAUG"] {
            send(
                &broker,
                &agent,
                json!({"action": "camera_snapshot", "camera_id": "cam-1", "image": image}),
            )
            .await;
        }
        let frames = drain_json(&mut all_rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1]["action"], "camera_snapshot");
        assert_eq!(frames[1]["image"], "BAUG");

        let record = broker.get_snapshot("acme", "cam-1").await.expect("cached");
        assert_eq!(record.image, vec![4, 5, 6]);
        assert_eq!(record.content_type, "image/jpeg");

        let (_late, mut late_rx) = dashboard(&broker, "dash-late", "acme").await;
        let replay = next_json(&mut late_rx).expect("replayed snapshot");
        assert_eq!(replay["action"], "camera_snapshot");
        assert_eq!(replay["camera_id"], "cam-1");
        assert_eq!(replay["image"], "BAUG");

        let (_global, mut global_rx) = dashboard(&broker, "dash-global", "all").await;
        assert!(next_json(&mut global_rx).is_none());
    }

    #[tokio::test]
    async fn send_to_offline_client_creates_no_pending_request() {
        let broker = test_broker();
        let before = broker.pending().len();
        let err = broker
            .send_and_await("ghost", json!({"action": "reboot"}), Duration::from_millis(100))
            .await
            .expect_err("offline");
        assert!(matches!(err, BrokerError::AgentOffline { .. }));
        assert_eq!(broker.pending().len(), before);

        let err = broker
            .send("ghost", json!({"action": "reboot"}))
            .await
            .expect_err("offline");
        assert!(matches!(err, BrokerError::AgentOffline { .. }));
    }

    #[tokio::test]
    async fn send_stamps_request_id_and_keeps_callers_id() {
        let broker = test_broker();
        let (_agent, mut rx) = auth(&broker, "conn-a", "acme").await;

        let generated = broker
            .send("acme", json!({"action": "reboot"}))
            .await
            .expect("sent");
        let forwarded = next_json(&mut rx).expect("forwarded");
        assert_eq!(forwarded["action"], "reboot");
        assert_eq!(forwarded["request_id"], generated.as_str());
        assert!(generated.starts_with("req_"));

        let kept = broker
            .send("acme", json!({"action": "reboot", "request_id": "mine-1"}))
            .await
            .expect("sent");
        assert_eq!(kept, "mine-1");

        let err = broker.send("acme", json!(["not", "an", "object"])).await;
        assert!(matches!(err, Err(BrokerError::InvalidCommand(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_agent_times_out_and_late_reply_is_a_noop() {
        let broker = test_broker();
        let (agent, mut rx) = auth(&broker, "conn-a", "acme").await;

        let started = tokio::time::Instant::now();
        let err = broker
            .send_and_await(
                "acme",
                json!({"action": "xmeye_snapshot", "request_id": "req-late"}),
                Duration::from_millis(100),
            )
            .await
            .expect_err("timeout");
        let elapsed = started.elapsed();
        assert!(matches!(err, BrokerError::CorrelationTimeout { .. }));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(150));
        assert!(broker.pending().is_empty());

        let _ = drain_json(&mut rx);
        send(
            &broker,
            &agent,
            json!({"action": "xmeye_snapshot_response", "request_id": "req-late", "success": true}),
        )
        .await;
        assert!(broker.pending().is_empty());
        assert!(broker.is_online("acme").await);
    }

    #[tokio::test]
    async fn agent_reply_reaches_caller_and_watching_dashboard() {
        let broker = test_broker();
        let (agent, mut agent_rx) = auth(&broker, "conn-a", "acme").await;
        let (_dash, mut dash_rx) = dashboard(&broker, "dash-x", "acme").await;

        let caller = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .send_and_await(
                        "acme",
                        json!({"action": "add_camera", "camera": {"name": "gate"}}),
                        Duration::from_secs(5),
                    )
                    .await
            })
        };

        let command = loop {
            if let Some(frame) = next_json(&mut agent_rx) {
                break frame;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(command["action"], "add_camera");
        let request_id = command["request_id"].as_str().expect("request id").to_string();

        send(
            &broker,
            &agent,
            json!({"action": "camera_added", "request_id": request_id, "camera": {"id": "cam-9"}}),
        )
        .await;

        let (answered_id, payload) = caller.await.expect("join").expect("reply");
        assert_eq!(answered_id, request_id);
        assert_eq!(payload["action"], "camera_added");
        assert_eq!(payload["camera"]["id"], "cam-9");
        assert_eq!(payload["cliente_id"], "acme");

        let event = next_json(&mut dash_rx).expect("dashboard broadcast");
        assert_eq!(event["action"], "camera_added");
        assert_eq!(event["request_id"], request_id.as_str());
        assert!(broker.pending().is_empty());
    }

    #[tokio::test]
    async fn disconnect_mid_flight_fails_the_caller() {
        let broker = test_broker();
        let (agent, _rx) = auth(&broker, "conn-a", "acme").await;
        let caller = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .send_and_await("acme", json!({"action": "reboot"}), Duration::from_secs(30))
                    .await
            })
        };
        while broker.pending().is_empty() {
            tokio::task::yield_now().await;
        }
        broker.teardown(&agent, "closed").await;
        let err = caller.await.expect("join").expect_err("disconnected");
        assert!(matches!(err, BrokerError::AgentDisconnected { .. }));
        assert!(!broker.is_online("acme").await);
    }

    #[tokio::test]
    async fn reauth_closes_superseded_transport_and_keeps_new_one() {
        let broker = test_broker();
        let (_dash, mut dash_rx) = dashboard(&broker, "dash-all", "all").await;
        let (old, mut old_rx) = auth(&broker, "conn-a", "acme").await;
        let (new, _new_rx) = auth(&broker, "conn-b", "acme").await;

        assert!(old.is_closed());
        assert!(matches!(old_rx.try_recv(), Ok(Message::Close(_))));

        broker.teardown(&old, "closed").await;
        let agent = broker.registry().get("acme").await.expect("still online");
        assert_eq!(agent.transport.conn_id(), new.conn_id());

        let actions = drain_json(&mut dash_rx)
            .into_iter()
            .map(|f| f["action"].as_str().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(actions, vec!["client_connected", "client_connected"]);
    }

    #[tokio::test]
    async fn reauth_under_new_id_releases_the_old_one() {
        let broker = test_broker();
        let (_dash, mut dash_rx) = dashboard(&broker, "dash-all", "all").await;
        let (agent, mut agent_rx) = auth(&broker, "conn-a", "acme").await;
        let _ = drain_json(&mut dash_rx);

        let caller = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .send_and_await("acme", json!({"action": "reboot"}), Duration::from_secs(30))
                    .await
            })
        };
        while broker.pending().is_empty() {
            tokio::task::yield_now().await;
        }

        send(
            &broker,
            &agent,
            json!({"action": "auth", "cliente_id": "globex"}),
        )
        .await;
        let err = caller.await.expect("join").expect_err("released");
        assert!(matches!(err, BrokerError::AgentDisconnected { .. }));
        assert!(broker.pending().is_empty());
        assert!(!broker.is_online("acme").await);
        assert!(broker.is_online("globex").await);
        assert!(!agent.is_closed());

        let replies = drain_json(&mut agent_rx)
            .into_iter()
            .filter(|frame| frame["action"] == "auth_success")
            .count();
        assert_eq!(replies, 1);
        assert_eq!(
            event_keys(drain_json(&mut dash_rx)),
            vec!["client_disconnected:acme", "client_connected:globex"]
        );
    }

    #[tokio::test]
    async fn typed_frame_with_request_id_reaches_dashboards_once() {
        let broker = test_broker();
        let (_dash, mut dash_rx) = dashboard(&broker, "dash-x", "acme").await;
        let (agent, mut agent_rx) = auth(&broker, "conn-a", "acme").await;
        let _ = drain_json(&mut dash_rx);

        send(
            &broker,
            &agent,
            json!({"action": "status_update", "request_id": "r1", "info": {"cams": 2}}),
        )
        .await;
        let frames = drain_json(&mut dash_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["action"], "status_update");
        assert_eq!(frames[0]["info"], json!({"cams": 2}));
        assert!(frames[0]["last_seen"].is_i64());

        send(
            &broker,
            &agent,
            json!({"type": "ping", "timestamp": 7, "request_id": "r2"}),
        )
        .await;
        assert!(drain_json(&mut dash_rx).is_empty());
        let pong = next_json(&mut agent_rx).expect("pong");
        assert_eq!(pong["type"], "pong");
    }

    #[tokio::test]
    async fn moving_dashboard_to_another_client_drops_the_old_scope() {
        let broker = test_broker();
        let (dash, mut dash_rx) = dashboard(&broker, "dash-1", "acme").await;
        send(
            &broker,
            &dash,
            json!({"action": "register_dashboard", "cliente_id": "globex"}),
        )
        .await;
        let ack = next_json(&mut dash_rx).expect("second ack");
        assert_eq!(ack["action"], "dashboard_registered");
        assert_eq!(ack["watch"], "globex");

        let (_agent, _agent_rx) = auth(&broker, "conn-a", "acme").await;
        assert!(next_json(&mut dash_rx).is_none());

        let (_other, _other_rx) = auth(&broker, "conn-b", "globex").await;
        let event = next_json(&mut dash_rx).expect("globex connect");
        assert_eq!(event["action"], "client_connected");
        assert_eq!(event["cliente_id"], "globex");
    }

    #[tokio::test]
    async fn numeric_request_id_is_forwarded_and_matched_as_sent() {
        let broker = test_broker();
        let (agent, mut agent_rx) = auth(&broker, "conn-a", "acme").await;

        let caller = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .send_and_await(
                        "acme",
                        json!({"action": "xmeye_snapshot", "request_id": 42}),
                        Duration::from_secs(5),
                    )
                    .await
            })
        };
        let command = loop {
            if let Some(frame) = next_json(&mut agent_rx) {
                break frame;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(command["request_id"], json!(42));

        send(
            &broker,
            &agent,
            json!({"action": "xmeye_snapshot_response", "request_id": 42, "success": true}),
        )
        .await;
        let (answered_id, payload) = caller.await.expect("join").expect("reply");
        assert_eq!(answered_id, "42");
        assert_eq!(payload["success"], true);
        assert!(broker.pending().is_empty());
    }

    #[tokio::test]
    async fn broadcast_skips_closed_dashboards() {
        let broker = test_broker();
        let (_live, mut live_rx) = dashboard(&broker, "dash-live", "acme").await;
        let (dead, dead_rx) = dashboard(&broker, "dash-dead", "all").await;
        drop(dead_rx);
        assert!(dead.is_closed());

        let delivered = broker.send_to_subscribers("acme", r#"{"action":"x"}"#).await;
        assert_eq!(delivered, 1);
        assert_eq!(next_json(&mut live_rx).expect("live")["action"], "x");
    }

    #[tokio::test]
    async fn shutdown_notifies_every_dashboard_and_closes_connections() {
        let broker = test_broker();
        let (scoped, mut scoped_rx) = dashboard(&broker, "dash-x", "acme").await;
        let (agent, _rx) = auth(&broker, "conn-a", "acme").await;
        let _ = drain_json(&mut scoped_rx);

        broker.shutdown().await;
        let notice = next_json(&mut scoped_rx).expect("notice");
        assert_eq!(notice["action"], "server_shutdown");
        assert!(scoped.is_closed());
        assert!(agent.is_closed());
    }
}
