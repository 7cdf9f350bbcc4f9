// src/config.rs

//! Manages engine configuration: loading, resolving defaults, and validation.

use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// Throttler defaults, per spec §4.1. Every field is overridable at runtime
/// via `Throttler::update_settings` / per-host circuit state.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ThrottlerConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    #[serde(default = "default_circuit_threshold")]
    pub circuit_threshold: u32,
    #[serde(default = "default_circuit_timeout", with = "humantime_serde")]
    pub circuit_timeout: Duration,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            request_delay_ms: default_request_delay_ms(),
            circuit_threshold: default_circuit_threshold(),
            circuit_timeout: default_circuit_timeout(),
        }
    }
}

fn default_max_concurrent() -> usize {
    4
}
fn default_request_delay_ms() -> u64 {
    500
}
fn default_circuit_threshold() -> u32 {
    3
}
fn default_circuit_timeout() -> Duration {
    Duration::from_secs(1800)
}

/// Engine-wide orchestrator timeout defaults (§5, §6). Jobs may override the
/// subset that's also a recognised `details` key; everything else is a pure
/// engine-level ceiling.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OrchestratorConfig {
    #[serde(default = "default_maintenance_timeout_secs")]
    pub maintenance_timeout_secs: u64,
    #[serde(default = "default_job_poll_timeout_secs")]
    pub job_poll_timeout_secs: u64,
    #[serde(default = "default_reboot_wait_timeout_secs")]
    pub reboot_wait_timeout_secs: u64,
    #[serde(default = "default_rebalance_wait_timeout_secs")]
    pub rebalance_wait_timeout_secs: u64,
    #[serde(default = "default_rebalance_quiet_period_secs")]
    pub rebalance_quiet_period_secs: u64,
    #[serde(default = "default_max_parallel_backups")]
    pub max_parallel_backups: usize,
    #[serde(default = "default_max_preflight_parallelism")]
    pub max_preflight_parallelism: usize,
    #[serde(default = "default_max_catalog_passes")]
    pub max_catalog_passes: u32,
    #[serde(default = "default_preflight_cache_ttl_hours")]
    pub preflight_cache_ttl_hours: u64,
    #[serde(default)]
    pub check_updates_in_preflight: bool,
    #[serde(default)]
    pub scheduled_auto_skip_blocked_hosts: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            maintenance_timeout_secs: default_maintenance_timeout_secs(),
            job_poll_timeout_secs: default_job_poll_timeout_secs(),
            reboot_wait_timeout_secs: default_reboot_wait_timeout_secs(),
            rebalance_wait_timeout_secs: default_rebalance_wait_timeout_secs(),
            rebalance_quiet_period_secs: default_rebalance_quiet_period_secs(),
            max_parallel_backups: default_max_parallel_backups(),
            max_preflight_parallelism: default_max_preflight_parallelism(),
            max_catalog_passes: default_max_catalog_passes(),
            preflight_cache_ttl_hours: default_preflight_cache_ttl_hours(),
            check_updates_in_preflight: false,
            scheduled_auto_skip_blocked_hosts: false,
        }
    }
}

fn default_maintenance_timeout_secs() -> u64 {
    1800
}
fn default_job_poll_timeout_secs() -> u64 {
    45 * 60
}
fn default_reboot_wait_timeout_secs() -> u64 {
    30 * 60
}
fn default_rebalance_wait_timeout_secs() -> u64 {
    420
}
fn default_rebalance_quiet_period_secs() -> u64 {
    45
}
fn default_max_parallel_backups() -> usize {
    3
}
fn default_max_preflight_parallelism() -> usize {
    4
}
fn default_max_catalog_passes() -> u32 {
    2
}
fn default_preflight_cache_ttl_hours() -> u64 {
    24
}

/// Metrics exporter configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9469
}

/// The engine's top-level runtime configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub throttler: ThrottlerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// How often the poller checks the Job Store for dispatchable jobs.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            throttler: ThrottlerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            metrics: MetricsConfig::default(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_poll_interval_secs() -> u64 {
    5
}

impl EngineConfig {
    /// Loads and validates configuration from a TOML file on disk.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file '{path}': {e}"))?;
        let config: EngineConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("failed to parse config file '{path}': {e}"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.throttler.max_concurrent == 0 {
            anyhow::bail!("throttler.max_concurrent must be at least 1");
        }
        if self.orchestrator.max_preflight_parallelism == 0 {
            anyhow::bail!("orchestrator.max_preflight_parallelism must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.throttler.max_concurrent, 4);
        assert_eq!(cfg.throttler.request_delay_ms, 500);
        assert_eq!(cfg.throttler.circuit_threshold, 3);
        assert_eq!(cfg.throttler.circuit_timeout, Duration::from_secs(1800));
        assert_eq!(cfg.orchestrator.max_parallel_backups, 3);
        assert_eq!(cfg.orchestrator.max_catalog_passes, 2);
    }

    #[test]
    fn from_file_parses_partial_overrides() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("fleet-cfg-test-{}.toml", std::process::id()));
        std::fs::write(&path, "poll_interval_secs = 10\n[throttler]\nmax_concurrent = 8\n").unwrap();
        let cfg = EngineConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.poll_interval_secs, 10);
        assert_eq!(cfg.throttler.max_concurrent, 8);
        assert_eq!(cfg.throttler.request_delay_ms, 500);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_zero_max_concurrent() {
        let mut cfg = EngineConfig::default();
        cfg.throttler.max_concurrent = 0;
        assert!(cfg.validate().is_err());
    }
}
