use axum::extract::ws::{CloseFrame, Message};
use chrono::{DateTime, Utc};
use relay_core::{ClientSummary, WatchKey};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Outbound half of one WebSocket connection.
///
/// Sends never block: a full queue or a closed socket counts as a failed
/// delivery for that destination only.
pub struct Transport {
    conn_id: String,
    sender: mpsc::Sender<Message>,
    shutdown: watch::Sender<bool>,
    awaiting_pong: AtomicBool,
}

impl Transport {
    /// Returns the handle plus the receiver the session loop watches for a forced close.
    pub fn new(
        conn_id: impl Into<String>,
        sender: mpsc::Sender<Message>,
    ) -> (Arc<Self>, watch::Receiver<bool>) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let transport = Arc::new(Self {
            conn_id: conn_id.into(),
            sender,
            shutdown,
            awaiting_pong: AtomicBool::new(false),
        });
        (transport, shutdown_rx)
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn send_text(&self, text: &str) -> bool {
        self.try_send(Message::Text(text.to_string()))
    }

    pub fn send_ping(&self) -> bool {
        self.try_send(Message::Ping(Vec::new()))
    }

    fn try_send(&self, msg: Message) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.sender.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = "send_backpressure", conn_id = %self.conn_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed() || *self.shutdown.borrow()
    }

    /// Transport-level pong arrived.
    pub fn mark_alive(&self) {
        self.awaiting_pong.store(false, Ordering::SeqCst);
    }

    /// Flags the connection as awaiting a pong; returns true if it already was.
    pub fn begin_probe(&self) -> bool {
        self.awaiting_pong.swap(true, Ordering::SeqCst)
    }

    /// Forced close (superseded, dead, shutdown).
    pub fn close(&self, reason: &str) {
        self.shut(CLOSE_POLICY_VIOLATION, reason);
    }

    /// Orderly close once the session loop is done reading.
    pub fn finish(&self) {
        self.shut(CLOSE_NORMAL, "");
    }

    fn shut(&self, code: u16, reason: &str) {
        if *self.shutdown.borrow() {
            return;
        }
        let _ = self.sender.try_send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })));
        self.shutdown.send_replace(true);
        debug!(event = "transport_close", conn_id = %self.conn_id, code = code, reason = reason);
    }
}

#[derive(Clone)]
pub struct AgentConnection {
    pub client_id: String,
    pub transport: Arc<Transport>,
    pub info: Value,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl AgentConnection {
    pub fn summary(&self) -> ClientSummary {
        ClientSummary {
            client_id: self.client_id.clone(),
            info: self.info.clone(),
            last_seen: self.last_seen.timestamp_millis(),
            connected_at: self.connected_at.timestamp_millis(),
        }
    }
}

/// Side effects of an `auth` the broker has to announce or clean up.
#[derive(Default)]
pub struct AgentRegistration {
    /// Older connection that held the same client id.
    pub superseded: Option<Arc<Transport>>,
    /// Client id this connection authenticated as before re-authenticating under a new one.
    pub released: Option<String>,
}

#[derive(Default)]
struct AgentTable {
    by_client: HashMap<String, AgentConnection>,
    by_conn: HashMap<String, String>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<Transport>>>,
    agents: RwLock<AgentTable>,
    dashboards: RwLock<HashMap<WatchKey, HashMap<String, Arc<Transport>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, transport: Arc<Transport>) {
        self.connections
            .write()
            .await
            .insert(transport.conn_id().to_string(), transport);
    }

    pub async fn detach(&self, conn_id: &str) -> bool {
        self.connections.write().await.remove(conn_id).is_some()
    }

    pub async fn connections(&self) -> Vec<Arc<Transport>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn register_agent(
        &self,
        client_id: &str,
        transport: Arc<Transport>,
        info: Value,
    ) -> AgentRegistration {
        let now = Utc::now();
        let conn_id = transport.conn_id().to_string();
        let mut outcome = AgentRegistration::default();
        let mut agents = self.agents.write().await;

        if let Some(previous_id) = agents.by_conn.get(&conn_id).cloned() {
            if previous_id != client_id {
                agents.by_client.remove(&previous_id);
                outcome.released = Some(previous_id);
            }
        }

        let replaced = agents.by_client.insert(
            client_id.to_string(),
            AgentConnection {
                client_id: client_id.to_string(),
                transport,
                info,
                connected_at: now,
                last_seen: now,
            },
        );
        if let Some(old) = replaced {
            if old.transport.conn_id() != conn_id {
                agents.by_conn.remove(old.transport.conn_id());
                outcome.superseded = Some(old.transport);
            }
        }
        agents.by_conn.insert(conn_id.clone(), client_id.to_string());

        info!(
            event = "agent_registered",
            client_id = client_id,
            conn_id = %conn_id,
            agents = agents.by_client.len()
        );
        outcome
    }

    /// Refreshes last-seen (and info when given); `None` when the client is gone.
    pub async fn touch_agent(
        &self,
        client_id: &str,
        info: Option<Value>,
    ) -> Option<AgentConnection> {
        let mut agents = self.agents.write().await;
        let entry = agents.by_client.get_mut(client_id)?;
        entry.last_seen = Utc::now();
        if let Some(info) = info {
            entry.info = info;
        }
        Some(entry.clone())
    }

    /// Drops the agent bound to this transport, unless a newer connection already took its id.
    pub async fn remove_agent(&self, transport: &Transport) -> Option<String> {
        let mut agents = self.agents.write().await;
        let client_id = agents.by_conn.remove(transport.conn_id())?;
        let owned = agents
            .by_client
            .get(&client_id)
            .map(|entry| entry.transport.conn_id() == transport.conn_id())
            .unwrap_or(false);
        if !owned {
            return None;
        }
        agents.by_client.remove(&client_id);
        info!(
            event = "agent_removed",
            client_id = %client_id,
            conn_id = %transport.conn_id(),
            agents = agents.by_client.len()
        );
        Some(client_id)
    }

    pub async fn get(&self, client_id: &str) -> Option<AgentConnection> {
        self.agents.read().await.by_client.get(client_id).cloned()
    }

    pub async fn client_for(&self, conn_id: &str) -> Option<String> {
        self.agents.read().await.by_conn.get(conn_id).cloned()
    }

    pub async fn agent_count(&self) -> usize {
        self.agents.read().await.by_client.len()
    }

    pub async fn list(&self) -> Vec<ClientSummary> {
        let mut clients = self
            .agents
            .read()
            .await
            .by_client
            .values()
            .map(AgentConnection::summary)
            .collect::<Vec<_>>();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        clients
    }

    /// A dashboard holds one watch key; registering again replaces the previous one.
    pub async fn register_dashboard(&self, transport: Arc<Transport>, watch: WatchKey) {
        let conn_id = transport.conn_id().to_string();
        let mut dashboards = self.dashboards.write().await;
        for members in dashboards.values_mut() {
            members.remove(&conn_id);
        }
        dashboards.retain(|_, members| !members.is_empty());
        dashboards
            .entry(watch.clone())
            .or_default()
            .insert(conn_id.clone(), transport);
        info!(event = "dashboard_registered", conn_id = %conn_id, watch = %watch);
    }

    pub async fn remove_dashboard(&self, transport: &Transport) -> bool {
        let mut dashboards = self.dashboards.write().await;
        let mut removed = false;
        for members in dashboards.values_mut() {
            removed |= members.remove(transport.conn_id()).is_some();
        }
        dashboards.retain(|_, members| !members.is_empty());
        if removed {
            info!(event = "dashboard_removed", conn_id = %transport.conn_id());
        }
        removed
    }

    /// Dashboards watching this client plus those watching everything, each once.
    pub async fn subscribers(&self, client_id: &str) -> Vec<Arc<Transport>> {
        let dashboards = self.dashboards.read().await;
        let scoped = WatchKey::Client(client_id.to_string());
        let mut targets: HashMap<&str, Arc<Transport>> = HashMap::new();
        for key in [&scoped, &WatchKey::All] {
            if let Some(members) = dashboards.get(key) {
                for (conn_id, transport) in members {
                    targets.entry(conn_id.as_str()).or_insert_with(|| transport.clone());
                }
            }
        }
        targets.into_values().collect()
    }

    pub async fn all_dashboards(&self) -> Vec<Arc<Transport>> {
        let dashboards = self.dashboards.read().await;
        let mut targets: HashMap<&str, Arc<Transport>> = HashMap::new();
        for members in dashboards.values() {
            for (conn_id, transport) in members {
                targets.entry(conn_id.as_str()).or_insert_with(|| transport.clone());
            }
        }
        targets.into_values().collect()
    }

    pub async fn dashboard_count(&self) -> usize {
        self.all_dashboards().await.len()
    }
}
