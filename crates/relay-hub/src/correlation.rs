use parking_lot::Mutex;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, info, warn};

use crate::error::BrokerError;

struct PendingEntry {
    ticket: u64,
    client_id: String,
    deadline: Instant,
    reply: oneshot::Sender<Value>,
}

/// Request id -> caller waiting for the agent's reply.
///
/// Every entry leaves the table exactly once: on its first matching reply, on
/// its deadline, when its waiter is dropped, or when its agent disconnects.
#[derive(Default)]
pub struct CorrelationTable {
    tickets: AtomicU64,
    pending: Mutex<HashMap<String, PendingEntry>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(
        self: &Arc<Self>,
        request_id: &str,
        client_id: &str,
        timeout: Duration,
    ) -> Result<PendingReply, BrokerError> {
        let deadline = Instant::now() + timeout;
        let ticket = self.tickets.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(request_id) {
                return Err(BrokerError::DuplicateRequest {
                    request_id: request_id.to_string(),
                });
            }
            pending.insert(
                request_id.to_string(),
                PendingEntry {
                    ticket,
                    client_id: client_id.to_string(),
                    deadline,
                    reply: tx,
                },
            );
        }
        debug!(
            event = "request_opened",
            request_id = request_id,
            client_id = client_id,
            timeout_ms = timeout.as_millis() as u64
        );
        Ok(PendingReply {
            request_id: request_id.to_string(),
            ticket,
            timeout,
            deadline,
            rx,
            table: self.clone(),
        })
    }

    /// Completes a pending request; unknown or already-resolved ids are ignored.
    pub fn resolve(&self, request_id: &str, payload: Value) -> bool {
        let entry = self.pending.lock().remove(request_id);
        match entry {
            Some(entry) => Self::complete(request_id, entry, payload),
            None => false,
        }
    }

    /// Like `resolve`, but only the agent the request was sent to may answer it.
    pub fn resolve_for(&self, client_id: &str, request_id: &str, payload: Value) -> bool {
        let owner = self
            .pending
            .lock()
            .get(request_id)
            .map(|entry| entry.client_id.clone());
        match owner {
            Some(owner) if owner == client_id => self.resolve(request_id, payload),
            Some(owner) => {
                warn!(
                    event = "reply_owner_mismatch",
                    request_id = request_id,
                    expected = %owner,
                    got = client_id
                );
                false
            }
            None => false,
        }
    }

    fn complete(request_id: &str, entry: PendingEntry, payload: Value) -> bool {
        let delivered = entry.reply.send(payload).is_ok();
        debug!(
            event = "request_resolved",
            request_id = request_id,
            client_id = %entry.client_id,
            delivered = delivered
        );
        delivered
    }

    /// Wakes every waiter on this client with a disconnect instead of letting
    /// them run to the deadline.
    pub fn fail_for_client(&self, client_id: &str) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, entry| entry.client_id != client_id);
        let failed = before - pending.len();
        if failed > 0 {
            info!(event = "requests_failed", client_id = client_id, count = failed);
        }
        failed
    }

    /// Drops entries whose deadline passed or whose waiter is gone.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, entry| entry.deadline > now && !entry.reply.is_closed());
        let purged = before - pending.len();
        if purged > 0 {
            debug!(event = "requests_purged", count = purged);
        }
        purged
    }

    #[cfg(test)]
    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.lock().contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    fn forget(&self, request_id: &str, ticket: u64) {
        let mut pending = self.pending.lock();
        if pending
            .get(request_id)
            .map(|entry| entry.ticket == ticket)
            .unwrap_or(false)
        {
            pending.remove(request_id);
        }
    }
}

/// Awaitable side of a pending request. Dropping it withdraws the request.
pub struct PendingReply {
    request_id: String,
    ticket: u64,
    timeout: Duration,
    deadline: Instant,
    rx: oneshot::Receiver<Value>,
    table: Arc<CorrelationTable>,
}

impl PendingReply {
    pub async fn wait(mut self) -> Result<Value, BrokerError> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) if Instant::now() < self.deadline => Err(BrokerError::AgentDisconnected {
                request_id: self.request_id.clone(),
            }),
            Ok(Err(_)) | Err(_) => {
                warn!(
                    event = "request_timeout",
                    request_id = %self.request_id,
                    timeout_ms = self.timeout.as_millis() as u64
                );
                Err(BrokerError::CorrelationTimeout {
                    request_id: self.request_id.clone(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.table.forget(&self.request_id, self.ticket);
    }
}
