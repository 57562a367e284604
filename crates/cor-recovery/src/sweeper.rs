//! Request Timeout Sweeper
//!
//! Background task that periodically marks PENDING requests whose timeout
//! window has elapsed as TIMEOUT. Correlation happens on the listener path;
//! the sweeper is the only component that settles requests nobody answered.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use cor_store::RequestRepository;

/// Settings for the timeout sweep task.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Whether the sweeper runs at all. Default: true.
    pub enabled: bool,
    /// How often to sweep. Default: 10 seconds.
    pub check_interval: Duration,
    /// Requests examined per sweep. Default: 100.
    pub batch_size: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(10),
            batch_size: 100,
        }
    }
}

/// Background task that times out unanswered requests.
pub struct TimeoutSweeper {
    requests: Arc<dyn RequestRepository>,
    config: SweeperConfig,
}

impl TimeoutSweeper {
    pub fn new(requests: Arc<dyn RequestRepository>, config: SweeperConfig) -> Self {
        Self { requests, config }
    }

    /// Run the sweep loop. Runs indefinitely until the task is cancelled.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Timeout sweeper is disabled");
            return;
        }

        info!(
            interval_secs = self.config.check_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Starting request timeout sweeper"
        );

        let mut ticker = interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }

    /// Perform a single sweep. Returns how many requests were transitioned
    /// to TIMEOUT.
    pub async fn sweep_once(&self) -> u64 {
        let elapsed = match self.requests.find_timed_out(self.config.batch_size).await {
            Ok(requests) => requests,
            Err(e) => {
                error!(error = %e, "Failed to scan for timed-out requests");
                return 0;
            }
        };

        if elapsed.is_empty() {
            debug!("No pending requests past their timeout");
            return 0;
        }

        let ids: Vec<String> = elapsed.iter().map(|r| r.request_id.clone()).collect();
        // Conditional update: anything correlated since the scan stays SUCCESS
        let count = match self.requests.mark_timed_out(ids).await {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, "Failed to mark timed-out requests");
                return 0;
            }
        };

        metrics::counter!("correlay.requests.timed_out_total").increment(count);
        metrics::gauge!("correlay.sweeper.last_sweep_count").set(count as f64);

        if count > 0 {
            info!(count = count, "Marked unanswered requests as TIMEOUT");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SweeperConfig::default();
        assert!(config.enabled);
        assert_eq!(config.check_interval, Duration::from_secs(10));
        assert_eq!(config.batch_size, 100);
    }
}
