//! Worker configuration from the environment.

use std::time::Duration;

use uuid::Uuid;

use crate::poller::PollerConfig;
use crate::retry::RetryPolicy;

/// Runtime configuration for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker identity; generated when not provided.
    pub worker_id: String,

    /// Pool this worker leases from (`WORKER_POOL_NAME`).
    pub pool: String,

    /// Capability filter, e.g. "cpu" or "gpu" (`WORKER_POOL_RUNTIME`).
    pub runtime: Option<String>,

    /// Concurrent slots; leasing stops while all are busy.
    pub max_concurrency: usize,

    /// Lease duration requested per entry. Must stay above the longest
    /// action deadline so live work is never reaped out from under a
    /// worker.
    pub lease_duration: Duration,

    /// Margin kept between the action deadline and the lease expiry.
    pub lease_grace: Duration,

    /// Per-entry heartbeat cadence; well under the lease duration.
    pub heartbeat_interval: Duration,

    /// Worker-registry heartbeat cadence.
    pub registry_heartbeat_interval: Duration,

    pub poller: PollerConfig,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            pool: "default".to_string(),
            runtime: None,
            max_concurrency: 8,
            lease_duration: Duration::from_secs(360),
            lease_grace: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
            registry_heartbeat_interval: Duration::from_secs(30),
            poller: PollerConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    /// Read configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(pool) = std::env::var("WORKER_POOL_NAME") {
            if !pool.is_empty() {
                config.pool = pool;
            }
        }
        config.runtime = std::env::var("WORKER_POOL_RUNTIME")
            .ok()
            .filter(|runtime| !runtime.is_empty());
        if let Some(id) = std::env::var("WORKER_ID").ok().filter(|id| !id.is_empty()) {
            config.worker_id = id;
        }
        if let Some(n) = env_parse::<usize>("WORKER_MAX_CONCURRENCY") {
            config.max_concurrency = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>("WORKER_LEASE_SECS") {
            config.lease_duration = Duration::from_secs(secs.max(10));
        }
        if let Some(secs) = env_parse::<u64>("WORKER_HEARTBEAT_SECS") {
            config.heartbeat_interval = Duration::from_secs(secs.max(1));
        }

        config
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = pool.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Deadline handed to an action, respecting the entry's own timeout
    /// while leaving the grace margin before the lease expires.
    pub fn action_deadline(&self, entry_timeout: Duration) -> Duration {
        let ceiling = self.lease_duration.saturating_sub(self.lease_grace);
        entry_timeout.min(ceiling).max(Duration::from_secs(1))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|raw| raw.parse().ok())
}
