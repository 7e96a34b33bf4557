//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

use quorum_core::admin::AdminConfig;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port used for healthchecks and metrics.
    pub http_port: u16,

    /// The Kubernetes namespace watched by this operator.
    pub namespace: String,
    /// The name of the pod on which this instance is running.
    pub pod_name: String,

    /// The duration in seconds for which a lease is considered held.
    ///
    /// To ensure stable cluster leadership, a 60 second lease is currently recommended.
    pub lease_duration_seconds: u32,
    /// The duration that a lease holder will retry refreshing lease.
    ///
    /// To ensure stable cluster leadership, a 10 seconds renew rate is currently recommended.
    pub lease_renew_seconds: u32,

    /// The number of clusters which may be reconciled concurrently.
    #[serde(default = "Config::default_workers")]
    pub workers: usize,
    /// The interval at which all known clusters are reconciled, regardless of changes.
    #[serde(default = "Config::default_resync_seconds")]
    pub resync_seconds: u64,
    /// The minimum delay before a blocked pass is retried.
    #[serde(default = "Config::default_requeue_seconds")]
    pub requeue_seconds: u64,
    /// The cap of the exponential backoff applied to failed passes.
    #[serde(default = "Config::default_max_backoff_seconds")]
    pub max_backoff_seconds: u64,
    /// The deadline of each K8s API call.
    #[serde(default = "Config::default_api_timeout_seconds")]
    pub api_timeout_seconds: u64,
    /// The deadline of a full reconciliation pass.
    #[serde(default = "Config::default_pass_timeout_seconds")]
    pub pass_timeout_seconds: u64,

    /// The database admin binary.
    #[serde(default = "Config::default_admin_binary")]
    pub admin_binary: String,
    /// The database backup binary.
    #[serde(default = "Config::default_backup_binary")]
    pub backup_binary: String,
    /// The deadline of each invocation of an admin tool.
    #[serde(default = "Config::default_admin_timeout_seconds")]
    pub admin_timeout_seconds: u64,
    /// The directory where cluster files for the admin tools are written.
    #[serde(default = "Config::default_cluster_file_dir")]
    pub cluster_file_dir: String,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that. In the future, this may take into account an optional config file as
    /// well.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants which deserialization alone can not express.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.workers >= 1, "WORKERS must be at least 1");
        ensure!(self.api_timeout_seconds >= 1, "API_TIMEOUT_SECONDS must be at least 1");
        ensure!(self.admin_timeout_seconds >= 1, "ADMIN_TIMEOUT_SECONDS must be at least 1");
        ensure!(self.pass_timeout_seconds >= 1, "PASS_TIMEOUT_SECONDS must be at least 1");
        ensure!(self.resync_seconds >= 1, "RESYNC_SECONDS must be at least 1");
        ensure!(
            self.max_backoff_seconds >= self.requeue_seconds,
            "MAX_BACKOFF_SECONDS must be greater than or equal to REQUEUE_SECONDS"
        );
        Ok(())
    }

    /// The settings used for building admin clients.
    pub fn admin_config(&self) -> AdminConfig {
        AdminConfig {
            admin_binary: self.admin_binary.clone(),
            backup_binary: self.backup_binary.clone(),
            cluster_file_dir: PathBuf::from(&self.cluster_file_dir),
            timeout: Duration::from_secs(self.admin_timeout_seconds),
        }
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_seconds)
    }

    pub fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.pass_timeout_seconds)
    }

    pub fn requeue(&self) -> Duration {
        Duration::from_secs(self.requeue_seconds)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_seconds)
    }

    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_seconds)
    }

    fn default_workers() -> usize {
        4
    }

    fn default_resync_seconds() -> u64 {
        300
    }

    fn default_requeue_seconds() -> u64 {
        5
    }

    fn default_max_backoff_seconds() -> u64 {
        300
    }

    fn default_api_timeout_seconds() -> u64 {
        10
    }

    fn default_pass_timeout_seconds() -> u64 {
        600
    }

    fn default_admin_binary() -> String {
        "fdbcli".into()
    }

    fn default_backup_binary() -> String {
        "fdbbackup".into()
    }

    fn default_admin_timeout_seconds() -> u64 {
        30
    }

    fn default_cluster_file_dir() -> String {
        "/var/run/quorum".into()
    }
}
