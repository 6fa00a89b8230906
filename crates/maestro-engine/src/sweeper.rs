use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::tracker::ExecutionTracker;

/// Periodically evicts finished executions from the tracker.
pub struct ExecutionSweeper {
    tracker: Arc<ExecutionTracker>,
    interval: Duration,
    max_age: Duration,
    cancel: CancellationToken,
}

impl ExecutionSweeper {
    pub fn new(
        tracker: Arc<ExecutionTracker>,
        interval: Duration,
        max_age: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tracker,
            interval,
            max_age,
            cancel,
        }
    }

    /// Run the sweep loop. Blocks until cancelled.
    pub async fn run(&self) {
        info!(
            interval_secs = self.interval.as_secs(),
            max_age_secs = self.max_age.as_secs(),
            "Execution sweeper started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.cancel.cancelled() => {
                    info!("Execution sweeper shutting down");
                    break;
                }
            }

            let evicted = self.tracker.clear_completed(self.max_age).await;
            debug!(evicted, "Sweep finished");
        }
    }
}
