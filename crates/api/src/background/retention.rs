//! Periodic eviction of finished executions.
//!
//! Spawns a background task that removes terminal executions past the
//! configured retention window (or beyond the retained-count cap) from the
//! execution store. Runs on a fixed interval using `tokio::time::interval`.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tumbler_pipeline::Tracker;

/// Run the retention loop until `cancel` is triggered.
pub async fn run(tracker: Arc<Tracker>, cancel: CancellationToken) {
    let policy = tracker.retention_policy();
    let period = tracker.config().eviction_interval();

    tracing::info!(
        retain_secs = policy.retain_for.num_seconds(),
        max_retained = policy.max_retained,
        interval_secs = period.as_secs(),
        "Execution retention job started"
    );

    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Execution retention job stopping");
                break;
            }
            _ = interval.tick() => {
                let evicted = tracker.evict_expired().await;
                if evicted > 0 {
                    tracing::info!(evicted, "Execution retention: evicted finished executions");
                } else {
                    tracing::debug!("Execution retention: nothing to evict");
                }
            }
        }
    }
}
