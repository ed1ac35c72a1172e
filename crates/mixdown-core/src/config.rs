//! Orchestrator configuration, loaded from a YAML file with serde
//! defaults so an empty file is a valid config.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Number of concurrent status-consumer tasks.
    #[serde(default = "default_consumer_pool_size")]
    pub consumer_pool_size: usize,

    /// Blocking-pop timeout for the status queue; bounds shutdown latency.
    #[serde(default = "default_pop_timeout_secs")]
    pub pop_timeout_secs: u64,

    /// Interval between timeout-sweeper passes.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Timeout applied to steps whose operation declares none.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// Hard ceiling over any per-operation timeout.
    #[serde(default = "default_max_step_timeout_secs")]
    pub max_step_timeout_secs: u64,

    /// Connection string for the redis-backed store/bus/cache.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

fn default_consumer_pool_size() -> usize {
    4
}
fn default_pop_timeout_secs() -> u64 {
    5
}
fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_step_timeout_secs() -> u64 {
    15 * 60
}
fn default_max_step_timeout_secs() -> u64 {
    2 * 60 * 60
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            consumer_pool_size: default_consumer_pool_size(),
            pop_timeout_secs: default_pop_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            default_step_timeout_secs: default_step_timeout_secs(),
            max_step_timeout_secs: default_max_step_timeout_secs(),
            redis_url: default_redis_url(),
        }
    }
}

impl OrchestratorConfig {
    pub fn load(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_yaml::from_str(&content)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }

    pub fn pop_timeout(&self) -> Duration {
        Duration::from_secs(self.pop_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Effective timeout for an operation: its own, clamped by the global
    /// ceiling, or the default when it declares none.
    pub fn step_timeout(&self, operation_timeout_secs: Option<u64>) -> Duration {
        let secs = operation_timeout_secs
            .unwrap_or(self.default_step_timeout_secs)
            .min(self.max_step_timeout_secs);
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_config_uses_defaults() {
        let config: OrchestratorConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.consumer_pool_size, 4);
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
    }

    #[test]
    fn partial_file_overrides_some_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "consumer_pool_size: 8\nsweep_interval_secs: 5").unwrap();

        let config = OrchestratorConfig::load(file.path()).unwrap();
        assert_eq!(config.consumer_pool_size, 8);
        assert_eq!(config.sweep_interval(), Duration::from_secs(5));
        assert_eq!(config.pop_timeout_secs, 5);
    }

    #[test]
    fn step_timeout_clamps_to_ceiling() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.step_timeout(None), Duration::from_secs(15 * 60));
        assert_eq!(config.step_timeout(Some(60)), Duration::from_secs(60));
        assert_eq!(
            config.step_timeout(Some(10 * 60 * 60)),
            Duration::from_secs(2 * 60 * 60)
        );
    }
}
