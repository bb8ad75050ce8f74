//! Centralized configuration for the tunnel server.
//!
//! Every option has a concrete default except `data_dir`, which the caller
//! must supply. Missing `data_dir` is the one condition that panics at
//! startup; everything else falls back to its default.

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

mod env {
    pub const LISTEN_ADDR: &str = "TUNNEL_LISTEN_ADDR";
    pub const DATA_DIR: &str = "TUNNEL_DATA_DIR";
    pub const PORT_RANGE_START: &str = "TUNNEL_PORT_RANGE_START";
    pub const PORT_RANGE_END: &str = "TUNNEL_PORT_RANGE_END";
    pub const RATE_LIMIT: &str = "TUNNEL_RATE_LIMIT";
    pub const MAX_PENDING: &str = "TUNNEL_MAX_PENDING";
    pub const HANDSHAKE_TIMEOUT_SECS: &str = "TUNNEL_HANDSHAKE_TIMEOUT_SECS";
    pub const KEEPALIVE_INTERVAL_SECS: &str = "TUNNEL_KEEPALIVE_INTERVAL_SECS";
    pub const KEEPALIVE_TIMEOUT_SECS: &str = "TUNNEL_KEEPALIVE_TIMEOUT_SECS";
}

const DEFAULT_LISTEN_ADDR: &str = ":2222";
const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 40000..=49999;
const DEFAULT_RATE_LIMIT: u32 = 10;
const DEFAULT_MAX_PENDING: usize = 50;
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(15);

/// Default service specs handed to every first-time agent, in order.
pub fn default_services() -> Vec<(String, u16)> {
    vec![("ssh".to_string(), 22), ("http".to_string(), 80)]
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub data_dir: PathBuf,
    pub port_range: RangeInclusive<u16>,
    pub rate_limit: u32,
    pub max_pending: usize,
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub default_services: Vec<(String, u16)>,
}

impl Config {
    /// Load configuration from the environment, applying defaults for any
    /// option that isn't set. Panics if `TUNNEL_DATA_DIR` is missing or if
    /// the resulting configuration violates its own timing invariants.
    pub fn from_env() -> Self {
        let data_dir = std::env::var(env::DATA_DIR)
            .unwrap_or_else(|_| panic!("{} environment variable is required", env::DATA_DIR));

        let config = Self {
            listen_addr: std::env::var(env::LISTEN_ADDR)
                .unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string()),
            data_dir: PathBuf::from(data_dir),
            port_range: parse_range(
                std::env::var(env::PORT_RANGE_START).ok(),
                std::env::var(env::PORT_RANGE_END).ok(),
            ),
            rate_limit: parse_or(std::env::var(env::RATE_LIMIT).ok(), DEFAULT_RATE_LIMIT),
            max_pending: parse_or(std::env::var(env::MAX_PENDING).ok(), DEFAULT_MAX_PENDING),
            handshake_timeout: parse_secs_or(
                std::env::var(env::HANDSHAKE_TIMEOUT_SECS).ok(),
                DEFAULT_HANDSHAKE_TIMEOUT,
            ),
            keepalive_interval: parse_secs_or(
                std::env::var(env::KEEPALIVE_INTERVAL_SECS).ok(),
                DEFAULT_KEEPALIVE_INTERVAL,
            ),
            keepalive_timeout: parse_secs_or(
                std::env::var(env::KEEPALIVE_TIMEOUT_SECS).ok(),
                DEFAULT_KEEPALIVE_TIMEOUT,
            ),
            default_services: default_services(),
        };

        config.validate();
        config
    }

    fn validate(&self) {
        if self.keepalive_timeout >= self.keepalive_interval {
            panic!("keepalive_timeout must be less than keepalive_interval");
        }
        if self.handshake_timeout >= self.keepalive_interval {
            panic!("handshake_timeout must be less than keepalive_interval");
        }
        if self.port_range.is_empty() {
            panic!("port_range must contain at least one port");
        }
    }
}

fn parse_range(start: Option<String>, end: Option<String>) -> RangeInclusive<u16> {
    match (start.and_then(|s| s.parse().ok()), end.and_then(|s| s.parse().ok())) {
        (Some(start), Some(end)) => start..=end,
        _ => DEFAULT_PORT_RANGE,
    }
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn parse_secs_or(raw: Option<String>, default: Duration) -> Duration {
    raw.and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            data_dir: PathBuf::from("/tmp/tunnel-test"),
            port_range: DEFAULT_PORT_RANGE,
            rate_limit: DEFAULT_RATE_LIMIT,
            max_pending: DEFAULT_MAX_PENDING,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            default_services: default_services(),
        }
    }

    #[test]
    fn defaults_satisfy_timing_invariants() {
        base_config().validate();
    }

    #[test]
    #[should_panic(expected = "keepalive_timeout must be less than keepalive_interval")]
    fn rejects_keepalive_timeout_not_less_than_interval() {
        let mut config = base_config();
        config.keepalive_timeout = config.keepalive_interval;
        config.validate();
    }

    #[test]
    #[should_panic(expected = "handshake_timeout must be less than keepalive_interval")]
    fn rejects_handshake_timeout_not_less_than_interval() {
        let mut config = base_config();
        config.handshake_timeout = config.keepalive_interval * 2;
        config.validate();
    }

    #[test]
    #[should_panic(expected = "port_range must contain at least one port")]
    fn rejects_empty_port_range() {
        let mut config = base_config();
        config.port_range = 100..=1;
        config.validate();
    }

    #[test]
    fn default_services_are_ssh_then_http() {
        let services = default_services();
        assert_eq!(services, vec![("ssh".to_string(), 22), ("http".to_string(), 80)]);
    }
}
