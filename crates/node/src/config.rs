//! Node Configuration

use anyhow::{Context, Result};
use clap::ValueEnum;
use committee_consensus::{
    ConsensusConfig, Digest, LeaderRotation, RetryPolicy, RoundRobinRotation, SeededRotation,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// How the leader of each state index is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RotationKind {
    /// state index modulo committee size
    RoundRobin,
    /// Permutation derived from the committee seed
    Seeded,
}

impl RotationKind {
    pub fn build(self, seed: Digest) -> Arc<dyn LeaderRotation> {
        match self {
            RotationKind::RoundRobin => Arc::new(RoundRobinRotation),
            RotationKind::Seeded => Arc::new(SeededRotation::new(seed)),
        }
    }
}

/// Committee node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Number of committee members
    pub committee_size: u16,
    /// Operator tick period in milliseconds
    pub tick_interval_ms: u64,
    /// Minimum spacing between balance requests in milliseconds
    pub balances_timeout_ms: u64,
    /// Pause between transaction post attempts in milliseconds
    pub submit_retry_interval_ms: u64,
    /// Give up posting after this many milliseconds
    pub submit_max_window_ms: u64,
    pub max_batch_size: usize,
    /// Notifications a request needs before selection (quorum when unset)
    pub min_notifications: Option<usize>,
    pub rotation: RotationKind,
    /// Native token balance of the origin state
    pub native_balance: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let consensus = ConsensusConfig::default();
        let retry = RetryPolicy::default();
        Self {
            committee_size: 4,
            tick_interval_ms: consensus.tick_interval.as_millis() as u64,
            balances_timeout_ms: consensus.balances_timeout.as_millis() as u64,
            submit_retry_interval_ms: retry.interval.as_millis() as u64,
            submit_max_window_ms: retry.max_window.as_millis() as u64,
            max_batch_size: consensus.max_batch_size,
            min_notifications: None,
            rotation: RotationKind::RoundRobin,
            native_balance: 1_000_000,
        }
    }
}

impl NodeConfig {
    /// Load a JSON config file; missing fields keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("writing config {}", path.display()))
    }

    /// Operator settings; rejects values the operator loop cannot run with
    pub fn consensus(&self) -> Result<ConsensusConfig> {
        anyhow::ensure!(self.tick_interval_ms > 0, "tick_interval_ms must be positive");
        anyhow::ensure!(self.max_batch_size > 0, "max_batch_size must be positive");
        Ok(ConsensusConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            balances_timeout: Duration::from_millis(self.balances_timeout_ms),
            submit_retry: RetryPolicy {
                interval: Duration::from_millis(self.submit_retry_interval_ms),
                max_window: Duration::from_millis(self.submit_max_window_ms),
            },
            max_batch_size: self.max_batch_size,
            reward_target: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_consensus() {
        let config = NodeConfig::default();
        let consensus = config.consensus().unwrap();
        assert_eq!(consensus.tick_interval, Duration::from_millis(100));
        assert_eq!(consensus.balances_timeout, Duration::from_secs(1));
        assert_eq!(consensus.submit_retry, RetryPolicy::default());
        assert_eq!(config.rotation, RotationKind::RoundRobin);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{ "committee_size": 7, "rotation": "seeded" }"#).unwrap();

        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.committee_size, 7);
        assert_eq!(config.rotation, RotationKind::Seeded);
        assert_eq!(config.max_batch_size, 100);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        let config = NodeConfig {
            min_notifications: Some(2),
            tick_interval_ms: 50,
            ..NodeConfig::default()
        };
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.min_notifications, Some(2));
        assert_eq!(loaded.consensus().unwrap().tick_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_zero_tick_is_rejected() {
        let config = NodeConfig {
            tick_interval_ms: 0,
            ..NodeConfig::default()
        };
        let err = config.consensus().unwrap_err();
        assert!(err.to_string().contains("tick_interval_ms"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{ "tick_interval_ms": 0 }"#).unwrap();
        assert!(NodeConfig::load(&path).unwrap().consensus().is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = NodeConfig::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(err.to_string().contains("reading config"));
    }
}
