//! Connection pool configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_MAX_CONNECTIONS_PER_HOST: i32 = 50;
pub const DEFAULT_PER_SERVER_WATERLINE: i32 = 4;

/// Immutable per-origin pool settings.
///
/// `max_connections_per_host` caps open plus opening connections; `-1`
/// disables the cap. `per_server_waterline` is the idle-pool high-water
/// mark per event loop; `-1` disables the discard-on-release check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionPoolConfig {
    pub origin_name: String,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_max_connections_per_host")]
    pub max_connections_per_host: i32,
    #[serde(default = "default_per_server_waterline")]
    pub per_server_waterline: i32,
}

fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MS
}

fn default_max_connections_per_host() -> i32 {
    DEFAULT_MAX_CONNECTIONS_PER_HOST
}

fn default_per_server_waterline() -> i32 {
    DEFAULT_PER_SERVER_WATERLINE
}

impl ConnectionPoolConfig {
    pub fn new(origin_name: impl Into<String>) -> Self {
        Self {
            origin_name: origin_name.into(),
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            max_connections_per_host: DEFAULT_MAX_CONNECTIONS_PER_HOST,
            per_server_waterline: DEFAULT_PER_SERVER_WATERLINE,
        }
    }

    pub fn with_idle_timeout_ms(mut self, idle_timeout_ms: u64) -> Self {
        self.idle_timeout_ms = idle_timeout_ms;
        self
    }

    pub fn with_max_connections_per_host(mut self, max: i32) -> Self {
        self.max_connections_per_host = max;
        self
    }

    pub fn with_per_server_waterline(mut self, waterline: i32) -> Self {
        self.per_server_waterline = waterline;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionPoolConfig::new("origin-a");
        assert_eq!(config.origin_name, "origin-a");
        assert_eq!(config.idle_timeout_ms, DEFAULT_IDLE_TIMEOUT_MS);
        assert_eq!(config.max_connections_per_host, DEFAULT_MAX_CONNECTIONS_PER_HOST);
        assert_eq!(config.per_server_waterline, DEFAULT_PER_SERVER_WATERLINE);
    }

    #[test]
    fn test_builder_overrides() {
        let config = ConnectionPoolConfig::new("origin-b")
            .with_idle_timeout_ms(30_000)
            .with_max_connections_per_host(-1)
            .with_per_server_waterline(1);
        assert_eq!(config.idle_timeout(), Duration::from_millis(30_000));
        assert_eq!(config.max_connections_per_host, -1);
        assert_eq!(config.per_server_waterline, 1);
    }
}
