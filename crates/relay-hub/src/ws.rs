use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{broker::Broker, registry::Transport};

#[derive(Clone, Copy, Debug)]
pub struct SessionSettings {
    pub queue_capacity: usize,
    pub write_timeout: Duration,
}

/// Drives one WebSocket from upgrade to teardown. Inbound frames are routed
/// in arrival order; outbound frames go through a bounded queue drained by a
/// dedicated writer task so a slow peer never blocks the broker.
pub async fn run_session(
    broker: Arc<Broker>,
    socket: WebSocket,
    remote: Option<SocketAddr>,
    settings: SessionSettings,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(settings.queue_capacity.max(1));
    let (transport, mut shutdown_rx) = Transport::new(broker.next_conn_id(), tx);

    let write_timeout = settings.write_timeout;
    let writer_conn = transport.conn_id().to_string();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(event = "write_error", conn_id = %writer_conn, error = %err);
                    return;
                }
                Err(_) => {
                    warn!(event = "write_timeout", conn_id = %writer_conn);
                    return;
                }
            }
            if closing {
                return;
            }
        }
    });

    info!(
        event = "ws_connected",
        conn_id = %transport.conn_id(),
        remote = %remote.map(|addr| addr.to_string()).unwrap_or_default()
    );
    broker.open_connection(&transport).await;

    let reason = loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break "forced";
                }
            }
            incoming = ws_receiver.next() => {
                let msg = match incoming {
                    Some(Ok(msg)) => msg,
                    Some(Err(err)) => {
                        warn!(event = "read_error", conn_id = %transport.conn_id(), error = %err);
                        break "read_error";
                    }
                    None => break "eof",
                };
                match msg {
                    Message::Text(text) => broker.route(&transport, text.as_bytes()).await,
                    Message::Binary(bytes) => broker.route(&transport, &bytes).await,
                    Message::Pong(_) => transport.mark_alive(),
                    Message::Ping(_) => {}
                    Message::Close(_) => {
                        info!(event = "client_close", conn_id = %transport.conn_id());
                        break "closed";
                    }
                }
            }
        }
    };

    broker.teardown(&transport, reason).await;
    transport.finish();
    drop(transport);
    if tokio::time::timeout(write_timeout, &mut write_task)
        .await
        .is_err()
    {
        write_task.abort();
    }
}
