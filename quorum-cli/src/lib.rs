//! The Quorum CLI.

mod cmd;
#[cfg(test)]
mod lib_test;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use structopt::StructOpt;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use quorum_core::admin::{AdminConfig, CliAdminClient};

/// The Quorum CLI.
#[derive(StructOpt)]
#[structopt(name = "quorum")]
pub struct Quorum {
    #[structopt(subcommand)]
    action: QuorumSubcommands,
    /// Enable debug logging.
    #[structopt(short)]
    verbose: bool,
    /// The cluster file of the database to interact with.
    ///
    /// When a connection string is given as well, it is written to this file.
    #[structopt(long, parse(from_os_str))]
    cluster_file: Option<PathBuf>,
    /// The connection string of the database to interact with.
    #[structopt(long)]
    connection_string: Option<String>,
    /// The database admin binary.
    #[structopt(long, default_value = "fdbcli")]
    admin_binary: String,
    /// The database backup binary.
    #[structopt(long, default_value = "fdbbackup")]
    backup_binary: String,
    /// The deadline in seconds of each invocation of an admin tool.
    #[structopt(long, default_value = "30")]
    timeout_seconds: u64,
}

impl Quorum {
    pub async fn run(self) -> Result<()> {
        // Initialize logging based on CLI config.
        let fmt_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);
        let filter_layer;
        let level_filter;
        if self.verbose {
            filter_layer = EnvFilter::new("debug");
            level_filter = LevelFilter::DEBUG;
        } else {
            filter_layer = EnvFilter::new("info");
            level_filter = LevelFilter::INFO;
        }
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .with(level_filter)
            .init();

        match &self.action {
            QuorumSubcommands::Backup(inner) => inner.run(&self).await,
            QuorumSubcommands::Exclude(inner) => inner.run(&self).await,
            QuorumSubcommands::Include(inner) => inner.run(&self).await,
            QuorumSubcommands::ExclusionStatus(inner) => inner.run(&self).await,
        }
    }

    /// Get a new admin client based on runtime config.
    pub async fn get_client(&self) -> Result<CliAdminClient> {
        if self.timeout_seconds == 0 {
            bail!("--timeout-seconds must be at least 1");
        }
        let (cluster_file, connection_string) = resolve_cluster_file(self.cluster_file.as_deref(), self.connection_string.as_deref()).await?;
        let config = AdminConfig {
            admin_binary: self.admin_binary.clone(),
            backup_binary: self.backup_binary.clone(),
            cluster_file_dir: cluster_file.parent().map(PathBuf::from).unwrap_or_default(),
            timeout: Duration::from_secs(self.timeout_seconds),
        };
        Ok(CliAdminClient::new(config, cluster_file, Some(connection_string)))
    }
}

/// Resolve the cluster file and connection string to use.
///
/// A missing connection string is read from the cluster file. A missing cluster file defaults to
/// a file in the temp dir.
async fn resolve_cluster_file(cluster_file: Option<&std::path::Path>, connection_string: Option<&str>) -> Result<(PathBuf, String)> {
    match (cluster_file, connection_string) {
        (Some(path), Some(conn)) => Ok((path.to_path_buf(), conn.to_string())),
        (None, Some(conn)) => Ok((std::env::temp_dir().join("quorum-cli.cluster"), conn.to_string())),
        (Some(path), None) => {
            let conn = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("error reading cluster file {}", path.display()))?;
            let conn = conn.trim();
            if conn.is_empty() {
                bail!("cluster file {} is empty", path.display());
            }
            Ok((path.to_path_buf(), conn.to_string()))
        }
        (None, None) => bail!("one of --cluster-file or --connection-string is required"),
    }
}

#[derive(StructOpt)]
pub enum QuorumSubcommands {
    /// Backup management.
    #[structopt(name = "backup")]
    Backup(cmd::backup::Backup),
    /// Exclude process groups, so that they shed their data and roles.
    #[structopt(name = "exclude")]
    Exclude(cmd::exclusion::Exclude),
    /// Re-include previously excluded process groups.
    #[structopt(name = "include")]
    Include(cmd::exclusion::Include),
    /// Show which of the given process groups still hold data or roles.
    #[structopt(name = "exclusion-status")]
    ExclusionStatus(cmd::exclusion::ExclusionStatus),
}
