//! Background cleanup loop.

use crate::error::Result;
use crate::queue::QueueService;
use tokio::sync::{oneshot, watch};
use tokio::time;
use tracing::{error, info};

/// Spawns the periodic cleanup task for `service`.
///
/// Every `clean_period` the task cleans all known queues and consumer
/// groups. The returned channel yields exactly one value: the first
/// cleanup or store error, or `Ok(())` once the stop signal fires. A
/// dropped stop sender counts as a stop. The task must be respawned to
/// keep cleaning after an error.
pub(crate) fn spawn(
    service: QueueService,
    mut stop: watch::Receiver<bool>,
) -> oneshot::Receiver<Result<()>> {
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(async move {
        let period = service.inner.config.clean_period;
        let mut tick = time::interval_at(time::Instant::now() + period, period);
        let mut store_errors = service.inner.store.error_channel();
        info!(period_ms = period.as_millis() as u64, "cleanup runner started");
        let result = loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = service.clean_all().await {
                        error!(error = %e, "cleanup failed");
                        break Err(e);
                    }
                }
                Some(e) = store_errors.recv() => {
                    error!(error = %e, "store failed");
                    break Err(e.into());
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        info!("cleanup runner stopped");
                        break Ok(());
                    }
                }
            }
        };
        let _ = done_tx.send(result);
    });
    done_rx
}
