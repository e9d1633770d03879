//! The periodic reconciliation actor (spec §4.4(b)): wakes up every
//! `tick_interval_ms`, samples load, and tries to expand replica sets.

use std::sync::Arc;
use std::time::Duration;

use pegasus_switch::SwitchDriver;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::controller::Controller;

pub async fn run<D: SwitchDriver>(
    tick_interval: Duration,
    controller: Arc<Mutex<Controller<D>>>,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(tick_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("reconciliation actor shutting down");
                return;
            }
            _ = interval.tick() => {
                let mut controller = controller.lock().await;
                match controller.reconcile() {
                    Ok(events) if events.is_empty() => {}
                    Ok(events) => debug!(count = events.len(), "reconciliation expanded replica sets"),
                    Err(err) => error!(error = %err, "reconciliation tick aborted"),
                }
            }
        }
    }
}
