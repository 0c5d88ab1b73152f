use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::broker::Broker;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub dead: usize,
    pub purged: usize,
}

/// One pass over every connection: anything still awaiting the pong from the
/// previous pass is closed and torn down, everything else gets a fresh ping.
pub async fn sweep_once(broker: &Broker) -> SweepReport {
    let mut report = SweepReport::default();
    for transport in broker.registry().connections().await {
        if transport.begin_probe() {
            warn!(event = "liveness_timeout", conn_id = %transport.conn_id());
            transport.close("ping_timeout");
            broker.teardown(&transport, "ping_timeout").await;
            report.dead += 1;
            continue;
        }
        if !transport.send_ping() && transport.is_closed() {
            warn!(event = "ping_failed", conn_id = %transport.conn_id());
            broker.teardown(&transport, "ping_failed").await;
            report.dead += 1;
            continue;
        }
        report.probed += 1;
    }
    if !broker.pending().is_empty() {
        report.purged = broker.pending().purge_expired();
    }
    debug!(
        event = "liveness_sweep",
        probed = report.probed,
        dead = report.dead,
        purged = report.purged
    );
    report
}

/// Runs `sweep_once` every `interval` until the shutdown flag flips.
/// A zero interval disables the sweeper.
pub fn spawn(
    broker: Arc<Broker>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        info!(event = "liveness_disabled");
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sweep_once(&broker).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(event = "liveness_stopped");
    }))
}
