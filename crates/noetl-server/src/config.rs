//! Server configuration, loaded once per process from the environment.

use std::time::Duration;

/// Orchestrator server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Postgres connection string.
    pub database_url: String,

    /// Bind host.
    pub host: String,

    /// Bind port.
    pub port: u16,

    /// Snowflake node id for this instance.
    pub node_id: u16,

    /// Number of scheduler shards across server instances.
    pub shard_count: u32,

    /// Shard index owned by this instance.
    pub shard_index: u32,

    /// Default lease granted on claim.
    pub default_lease: Duration,

    /// Queue depth per pool above which issuance is deferred.
    pub max_queue_depth: u64,

    /// Scheduler tick interval (lease reaping, cancelled-execution sweep).
    pub tick_interval: Duration,

    /// Default delivery cap per command.
    pub default_max_attempts: i32,

    /// Default worker pool commands route to.
    pub default_pool: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/noetl".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8082,
            node_id: 1,
            shard_count: 1,
            shard_index: 0,
            default_lease: Duration::from_secs(60),
            max_queue_depth: 10_000,
            tick_interval: Duration::from_secs(5),
            default_max_attempts: 3,
            default_pool: "cpu".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_or("NOETL_DATABASE_URL", defaults.database_url),
            host: env_or("NOETL_HOST", defaults.host),
            port: parse_or("NOETL_PORT", defaults.port),
            node_id: parse_or("NOETL_NODE_ID", defaults.node_id),
            shard_count: parse_or("NOETL_SHARD_COUNT", defaults.shard_count).max(1),
            shard_index: parse_or("NOETL_SHARD_INDEX", defaults.shard_index),
            default_lease: Duration::from_millis(parse_or(
                "NOETL_LEASE_MS",
                defaults.default_lease.as_millis() as u64,
            )),
            max_queue_depth: parse_or("NOETL_MAX_QUEUE_DEPTH", defaults.max_queue_depth),
            tick_interval: Duration::from_millis(parse_or(
                "NOETL_TICK_MS",
                defaults.tick_interval.as_millis() as u64,
            )),
            default_max_attempts: parse_or(
                "NOETL_MAX_DELIVERY_ATTEMPTS",
                defaults.default_max_attempts,
            ),
            default_pool: env_or("NOETL_DEFAULT_POOL", defaults.default_pool),
        }
    }

    /// Whether this instance owns the given execution.
    pub fn owns_execution(&self, execution_id: i64) -> bool {
        (execution_id.unsigned_abs() % u64::from(self.shard_count)) as u32 == self.shard_index
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8082);
        assert_eq!(config.shard_count, 1);
        assert!(config.owns_execution(12345));
    }

    #[test]
    fn test_sharding() {
        let config = ServerConfig {
            shard_count: 4,
            shard_index: 1,
            ..Default::default()
        };
        assert!(config.owns_execution(5));
        assert!(!config.owns_execution(4));
    }
}
