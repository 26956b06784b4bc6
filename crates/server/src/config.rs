//! Server configuration

use anyhow::Result;
use fleet_lib::monitor::MonitorConfig;
use fleet_lib::objects::DEFAULT_MAX_FILE_SIZE;
use fleet_lib::orchestrator::OrchestratorConfig;
use fleet_lib::scheduler::SchedulerConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

const DEFAULT_CONFIG_FILE: &str = "fleet.toml";

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Port of the HTTP API, health and metrics endpoints
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// JSON snapshot of the store; in-memory only when unset
    #[serde(default)]
    pub state_path: Option<PathBuf>,

    #[serde(default = "default_object_store_dir")]
    pub object_store_dir: PathBuf,

    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,

    #[serde(default = "default_liveness_interval")]
    pub liveness_interval_secs: u64,

    #[serde(default = "default_staleness_interval")]
    pub staleness_interval_secs: u64,

    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_minutes: i64,

    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,

    #[serde(default = "default_reachability_timeout")]
    pub reachability_timeout_secs: u64,

    #[serde(default = "default_probe_connect_timeout")]
    pub probe_connect_timeout_secs: u64,

    #[serde(default = "default_manual_check_timeout")]
    pub manual_check_timeout_secs: u64,

    /// Directory on agents receiving scripts and results
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,

    #[serde(default = "default_deploy_timeout")]
    pub deploy_timeout_secs: u64,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_run_grace")]
    pub run_grace_secs: u64,

    #[serde(default = "default_max_concurrent_pipelines")]
    pub max_concurrent_pipelines: usize,

    /// Skip known_hosts verification of agent host keys
    #[serde(default = "default_accept_unknown_host_keys")]
    pub accept_unknown_host_keys: bool,
}

fn default_api_port() -> u16 {
    8080
}

fn default_object_store_dir() -> PathBuf {
    PathBuf::from("./data/objects")
}

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

fn default_liveness_interval() -> u64 {
    120
}

fn default_staleness_interval() -> u64 {
    600
}

fn default_stale_threshold() -> i64 {
    30
}

fn default_probe_concurrency() -> usize {
    8
}

fn default_reachability_timeout() -> u64 {
    3
}

fn default_probe_connect_timeout() -> u64 {
    5
}

fn default_manual_check_timeout() -> u64 {
    10
}

fn default_remote_dir() -> String {
    "/tmp".to_string()
}

fn default_deploy_timeout() -> u64 {
    30
}

fn default_fetch_timeout() -> u64 {
    60
}

fn default_run_grace() -> u64 {
    5
}

fn default_max_concurrent_pipelines() -> usize {
    16
}

fn default_accept_unknown_host_keys() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            state_path: None,
            object_store_dir: default_object_store_dir(),
            max_file_size_bytes: default_max_file_size(),
            liveness_interval_secs: default_liveness_interval(),
            staleness_interval_secs: default_staleness_interval(),
            stale_threshold_minutes: default_stale_threshold(),
            probe_concurrency: default_probe_concurrency(),
            reachability_timeout_secs: default_reachability_timeout(),
            probe_connect_timeout_secs: default_probe_connect_timeout(),
            manual_check_timeout_secs: default_manual_check_timeout(),
            remote_dir: default_remote_dir(),
            deploy_timeout_secs: default_deploy_timeout(),
            fetch_timeout_secs: default_fetch_timeout(),
            run_grace_secs: default_run_grace(),
            max_concurrent_pipelines: default_max_concurrent_pipelines(),
            accept_unknown_host_keys: default_accept_unknown_host_keys(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from an optional `fleet.toml` (or `FLEET_CONFIG`)
    /// and `FLEET_*` environment variables
    pub fn load() -> Result<Self> {
        let path = std::env::var("FLEET_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());

        let config = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix("FLEET")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize().unwrap_or_else(|e| {
            warn!(error = %e, "Invalid configuration, falling back to defaults");
            ServerConfig::default()
        }))
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            reachability_timeout: Duration::from_secs(self.reachability_timeout_secs),
            probe_connect_timeout: Duration::from_secs(self.probe_connect_timeout_secs),
            manual_check_timeout: Duration::from_secs(self.manual_check_timeout_secs),
            probe_concurrency: self.probe_concurrency,
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            remote_dir: self.remote_dir.clone(),
            deploy_timeout: Duration::from_secs(self.deploy_timeout_secs),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            run_grace: Duration::from_secs(self.run_grace_secs),
            max_concurrent_pipelines: self.max_concurrent_pipelines,
            ..OrchestratorConfig::default()
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            liveness_interval: Duration::from_secs(self.liveness_interval_secs.max(1)),
            staleness_interval: Duration::from_secs(self.staleness_interval_secs.max(1)),
            stale_threshold: chrono::Duration::minutes(self.stale_threshold_minutes),
            ..SchedulerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.max_file_size_bytes, 10 * 1024 * 1024);
        assert_eq!(config.scheduler().liveness_interval, Duration::from_secs(120));
        assert_eq!(config.scheduler().stale_threshold, chrono::Duration::minutes(30));
        assert_eq!(config.orchestrator().remote_dir, "/tmp");
        assert_eq!(config.monitor().probe_concurrency, 8);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(&path, "api_port = 9000\nstale_threshold_minutes = 45\n").unwrap();

        let config: ServerConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.api_port, 9000);
        assert_eq!(config.stale_threshold_minutes, 45);
        assert_eq!(config.liveness_interval_secs, 120);
        assert!(config.accept_unknown_host_keys);
    }
}
