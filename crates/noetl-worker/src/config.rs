//! Worker configuration.

use std::collections::HashMap;
use std::time::Duration;

use uuid::Uuid;

/// Configuration for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Server base URL.
    pub server_url: String,

    /// Unique worker id; generated when not provided.
    pub worker_id: String,

    /// Pool this worker claims from.
    pub pool: String,

    /// Runtime class advertised to the server (cpu, gpu, qpu, ...).
    pub runtime: String,

    /// Maximum concurrent command executions.
    pub capacity: usize,

    /// Free-form labels for routing and diagnostics.
    pub labels: HashMap<String, String>,

    /// Lease requested on claim; extended by heartbeats.
    pub lease: Duration,

    /// Heartbeat interval while executing; kept well under the lease.
    pub heartbeat_interval: Duration,

    /// Claim polling bounds (adaptive backoff between them).
    pub poll_min: Duration,
    pub poll_max: Duration,

    /// Credential cache TTL.
    pub credential_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8082".to_string(),
            worker_id: format!("worker-{}", Uuid::now_v7()),
            pool: "cpu".to_string(),
            runtime: "cpu".to_string(),
            capacity: 4,
            labels: HashMap::new(),
            lease: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(10),
            poll_min: Duration::from_millis(200),
            poll_max: Duration::from_secs(5),
            credential_ttl: Duration::from_secs(300),
        }
    }
}

impl WorkerConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_url: env_or("NOETL_SERVER_URL", defaults.server_url),
            worker_id: env_or("NOETL_WORKER_ID", defaults.worker_id),
            pool: env_or("NOETL_WORKER_POOL", defaults.pool),
            runtime: env_or("NOETL_WORKER_RUNTIME", defaults.runtime),
            capacity: parse_or("NOETL_WORKER_CAPACITY", defaults.capacity),
            labels: parse_labels(std::env::var("NOETL_WORKER_LABELS").ok().as_deref()),
            lease: Duration::from_millis(parse_or(
                "NOETL_LEASE_MS",
                defaults.lease.as_millis() as u64,
            )),
            heartbeat_interval: Duration::from_millis(parse_or(
                "NOETL_HEARTBEAT_MS",
                defaults.heartbeat_interval.as_millis() as u64,
            )),
            poll_min: Duration::from_millis(parse_or(
                "NOETL_POLL_MIN_MS",
                defaults.poll_min.as_millis() as u64,
            )),
            poll_max: Duration::from_millis(parse_or(
                "NOETL_POLL_MAX_MS",
                defaults.poll_max.as_millis() as u64,
            )),
            credential_ttl: Duration::from_millis(parse_or(
                "NOETL_CREDENTIAL_TTL_MS",
                defaults.credential_ttl.as_millis() as u64,
            )),
        }
    }

    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = pool.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
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

/// Parse `k=v,k2=v2` label lists.
fn parse_labels(raw: Option<&str>) -> HashMap<String, String> {
    raw.map(|s| {
        s.split(',')
            .filter_map(|pair| {
                let (k, v) = pair.split_once('=')?;
                Some((k.trim().to_string(), v.trim().to_string()))
            })
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.pool, "cpu");
        assert!(config.heartbeat_interval < config.lease);
    }

    #[test]
    fn test_parse_labels() {
        let labels = parse_labels(Some("zone=us-1, tier=hot"));
        assert_eq!(labels["zone"], "us-1");
        assert_eq!(labels["tier"], "hot");
        assert!(parse_labels(None).is_empty());
    }
}
