//! Backup management.

use anyhow::{Context, Result};
use structopt::StructOpt;

use crate::Quorum;
use quorum_core::admin::AdminClient;

/// Backup management.
#[derive(StructOpt)]
#[structopt(name = "backup")]
pub struct Backup {
    #[structopt(subcommand)]
    action: BackupSubcommands,
}

impl Backup {
    pub async fn run(&self, base: &Quorum) -> Result<()> {
        let client = base.get_client().await?;
        match &self.action {
            BackupSubcommands::Start { url, snapshot_period_seconds } => {
                tracing::info!(%url, snapshot_period_seconds, "starting backup");
                client.start_backup(url, *snapshot_period_seconds).await?;
            }
            BackupSubcommands::Stop => {
                tracing::info!("stopping backup");
                client.stop_backup().await?;
            }
            BackupSubcommands::Pause => {
                tracing::info!("pausing backup agents");
                client.pause_backups().await?;
            }
            BackupSubcommands::Resume => {
                tracing::info!("resuming backup agents");
                client.resume_backups().await?;
            }
            BackupSubcommands::Modify { snapshot_period_seconds } => {
                tracing::info!(snapshot_period_seconds, "modifying backup");
                client.modify_backup(*snapshot_period_seconds).await?;
            }
            BackupSubcommands::Status => {
                let status = client.get_backup_status().await?;
                let out = serde_json::to_string_pretty(&status).context("error encoding backup status")?;
                println!("{}", out);
            }
        }
        Ok(())
    }
}

#[derive(StructOpt)]
enum BackupSubcommands {
    /// Start a continuous backup.
    Start {
        /// The destination URL of the backup.
        #[structopt(long)]
        url: String,
        /// The target duration in seconds of a complete snapshot.
        #[structopt(long, default_value = "864000")]
        snapshot_period_seconds: u32,
    },
    /// Stop the running backup.
    Stop,
    /// Pause the backup agents.
    Pause,
    /// Resume paused backup agents.
    Resume,
    /// Update the snapshot period of the running backup.
    Modify {
        /// The target duration in seconds of a complete snapshot.
        #[structopt(long)]
        snapshot_period_seconds: u32,
    },
    /// Print the status of the current backup as JSON.
    Status,
}
