//! Configuration for minishard components
//!
//! Loaded from an optional `minishard.toml` and `MINISHARD__*` environment
//! variables (e.g. `MINISHARD__BALANCER__IMBALANCE_THRESHOLD=4`).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub balancer: BalancerConfig,

    #[serde(default)]
    pub migration: MigrationConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load from `minishard.toml` (optional) and the environment, falling
    /// back to defaults when nothing is found or parsing fails.
    pub fn load() -> Self {
        Self::load_from("minishard")
    }

    pub fn load_from(file_stem: &str) -> Self {
        let built = config::Config::builder()
            .add_source(config::File::with_name(file_stem).required(false))
            .add_source(config::Environment::with_prefix("MINISHARD").separator("__"))
            .build();

        match built.and_then(|c| c.try_deserialize::<Config>()) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!("Failed to load config ({}), using defaults", e);
                Config::default()
            }
        }
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Node ID, also the balancer lease holder name
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Bind address for the admin HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// RocksDB path for metadata
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Poll interval while waiting for a draining shard to empty
    #[serde(default = "default_drain_poll")]
    pub drain_poll_ms: u64,
}

fn default_node_id() -> String {
    "coord-1".to_string()
}
fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7000))
}
fn default_db_path() -> PathBuf {
    PathBuf::from("./coord-data")
}
fn default_drain_poll() -> u64 {
    200
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            drain_poll_ms: default_drain_poll(),
        }
    }
}

impl CoordinatorConfig {
    pub fn drain_poll(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms)
    }
}

/// Balancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Rounds do nothing while `max load - min load` is at or below this
    #[serde(default = "default_threshold")]
    pub imbalance_threshold: f64,

    /// Upper bound on concurrently running migration tickets
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_migrations: usize,

    /// Interval between rounds
    #[serde(default = "default_round_interval")]
    pub round_interval_ms: u64,

    /// Consecutive aborts before a chunk is flagged needs-attention
    #[serde(default = "default_abort_limit")]
    pub abort_limit: u32,

    /// Rounds to wait after the first abort; doubles per further abort
    #[serde(default = "default_backoff_rounds")]
    pub backoff_rounds: u64,

    #[serde(default = "default_max_backoff_rounds")]
    pub max_backoff_rounds: u64,

    /// Round reports kept in the metadata store
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// Balancer leadership lease
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_ms: u64,

    /// Weigh shard load by estimated bytes instead of chunk count
    #[serde(default)]
    pub weigh_by_bytes: bool,
}

fn default_threshold() -> f64 {
    2.0
}
fn default_max_concurrent() -> usize {
    4
}
fn default_round_interval() -> u64 {
    1_000
}
fn default_abort_limit() -> u32 {
    3
}
fn default_backoff_rounds() -> u64 {
    1
}
fn default_max_backoff_rounds() -> u64 {
    64
}
fn default_max_history() -> usize {
    100
}
fn default_lease_ttl() -> u64 {
    10_000
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            imbalance_threshold: default_threshold(),
            max_concurrent_migrations: default_max_concurrent(),
            round_interval_ms: default_round_interval(),
            abort_limit: default_abort_limit(),
            backoff_rounds: default_backoff_rounds(),
            max_backoff_rounds: default_max_backoff_rounds(),
            max_history: default_max_history(),
            lease_ttl_ms: default_lease_ttl(),
            weigh_by_bytes: false,
        }
    }
}

impl BalancerConfig {
    pub fn round_interval(&self) -> Duration {
        Duration::from_millis(self.round_interval_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }
}

/// Migration protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Ceiling for the cloning phase
    #[serde(default = "default_clone_timeout")]
    pub clone_timeout_ms: u64,

    /// Ceiling for the catch-up phase
    #[serde(default = "default_catch_up_timeout")]
    pub catch_up_timeout_ms: u64,

    /// Catch-up ends once a drained batch is at most this long
    #[serde(default = "default_max_lag")]
    pub max_catch_up_lag: usize,

    /// Pause between catch-up batches
    #[serde(default = "default_catch_up_pause")]
    pub catch_up_pause_ms: u64,

    /// Migration lock records older than this may be taken over
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_ms: u64,
}

fn default_clone_timeout() -> u64 {
    60_000
}
fn default_catch_up_timeout() -> u64 {
    30_000
}
fn default_max_lag() -> usize {
    16
}
fn default_catch_up_pause() -> u64 {
    5
}
fn default_lock_ttl() -> u64 {
    300_000
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            clone_timeout_ms: default_clone_timeout(),
            catch_up_timeout_ms: default_catch_up_timeout(),
            max_catch_up_lag: default_max_lag(),
            catch_up_pause_ms: default_catch_up_pause(),
            lock_ttl_ms: default_lock_ttl(),
        }
    }
}

impl MigrationConfig {
    pub fn clone_timeout(&self) -> Duration {
        Duration::from_millis(self.clone_timeout_ms)
    }

    pub fn catch_up_timeout(&self) -> Duration {
        Duration::from_millis(self.catch_up_timeout_ms)
    }

    pub fn catch_up_pause(&self) -> Duration {
        Duration::from_millis(self.catch_up_pause_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.balancer.abort_limit, 3);
        assert_eq!(cfg.balancer.max_concurrent_migrations, 4);
        assert_eq!(cfg.coordinator.bind_addr.port(), 7000);
        assert_eq!(cfg.migration.clone_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.toml");
        std::fs::write(
            &path,
            "[balancer]\nimbalance_threshold = 5.0\nmax_concurrent_migrations = 2\n\n[coordinator]\nnode_id = \"coord-9\"\n",
        )
        .unwrap();

        let stem = dir.path().join("cluster");
        let cfg = Config::load_from(stem.to_str().unwrap());
        assert_eq!(cfg.balancer.imbalance_threshold, 5.0);
        assert_eq!(cfg.balancer.max_concurrent_migrations, 2);
        assert_eq!(cfg.balancer.abort_limit, 3);
        assert_eq!(cfg.coordinator.node_id, "coord-9");
    }
}
