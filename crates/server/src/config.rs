//! Server configuration from the environment.

use std::net::SocketAddr;
use std::time::Duration;

/// Broker daemon tuning.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Poll interval while there is scheduling work.
    pub min_interval: Duration,

    /// Poll interval ceiling while idle.
    pub max_interval: Duration,

    /// Backoff multiplier after an idle poll.
    pub backoff_multiplier: f64,

    /// Dirty executions handled per poll.
    pub batch: i64,

    /// How often expired leases are returned to ready.
    pub reap_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
            backoff_multiplier: 1.5,
            batch: 32,
            reap_interval: Duration::from_secs(10),
        }
    }
}

/// Process-wide configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub bind_port: u16,
    pub broker: BrokerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            bind_port: 8090,
            broker: BrokerConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(addr) = std::env::var("BIND_ADDR").ok().filter(|a| !a.is_empty()) {
            config.bind_addr = addr;
        }
        if let Some(port) = env_parse::<u16>("BIND_PORT") {
            config.bind_port = port;
        }
        if let Some(ms) = env_parse::<u64>("BROKER_POLL_MS") {
            config.broker.min_interval = Duration::from_millis(ms.max(10));
        }
        if let Some(n) = env_parse::<i64>("BROKER_BATCH") {
            config.broker.batch = n.clamp(1, 1024);
        }
        if let Some(secs) = env_parse::<u64>("QUEUE_REAP_SECS") {
            config.broker.reap_interval = Duration::from_secs(secs.max(1));
        }

        config
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.bind_addr, self.bind_port).parse()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|raw| raw.parse().ok())
}
