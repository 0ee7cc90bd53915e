//! Adaptive lease polling.
//!
//! Backs off exponentially while the queue is empty and snaps back to the
//! minimum interval as soon as work appears.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Poll interval while entries keep arriving.
    pub min_interval: Duration,

    /// Poll interval ceiling while idle.
    pub max_interval: Duration,

    /// Backoff multiplier applied after an empty poll.
    pub backoff_multiplier: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
        }
    }
}

/// Tracks the current poll interval.
#[derive(Debug)]
pub struct LeaseBackoff {
    config: PollerConfig,
    current: Duration,
}

impl LeaseBackoff {
    pub fn new(config: PollerConfig) -> Self {
        let current = config.min_interval;
        Self { config, current }
    }

    /// Record the result of a poll and return the interval to wait before
    /// the next one.
    pub fn record(&mut self, found_work: bool) -> Duration {
        if found_work {
            self.current = self.config.min_interval;
        } else {
            let next = Duration::from_secs_f64(
                self.current.as_secs_f64() * self.config.backoff_multiplier,
            );
            self.current = next.min(self.config.max_interval);
        }
        self.current
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}
