mod broker;
mod config;
mod correlation;
mod error;
mod http;
mod liveness;
mod logging;
mod registry;
mod snapshots;
mod ws;

use std::{net::SocketAddr, sync::Arc};
use tokio::sync::watch;
use tracing::{error, info};

use crate::{
    broker::{Broker, RouterSettings},
    config::load_config,
    correlation::CorrelationTable,
    http::{router, AppState},
    logging::init_logging,
    registry::ConnectionRegistry,
    snapshots::SnapshotCache,
};

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let broker = Arc::new(Broker::new(
        RouterSettings {
            max_frame_bytes: config.max_frame_bytes,
            debug: config.debug,
        },
        ConnectionRegistry::new(),
        SnapshotCache::new(),
        Arc::new(CorrelationTable::new()),
    ));
    let (stop_tx, stop_rx) = watch::channel(false);
    let sweeper = liveness::spawn(broker.clone(), config.sweep_interval, stop_rx);

    let app = router(AppState {
        broker: broker.clone(),
        session: config.session(),
        request_timeout: config.request_timeout,
    });

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err, addr = %addr);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %addr,
        sweep_secs = config.sweep_interval.as_secs(),
        request_timeout_secs = config.request_timeout.as_secs()
    );

    let shutdown_broker = broker.clone();
    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_stopping");
        shutdown_broker.shutdown().await;
    };

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(event = "hub_error", error = %err);
    }

    stop_tx.send_replace(true);
    if let Some(handle) = sweeper {
        let _ = handle.await;
    }
    info!(event = "hub_stopped");
}
