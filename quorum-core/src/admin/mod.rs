//! Administrative access to a running database.
//!
//! The reconciliation pipeline and the `quorum` CLI both drive the database through the
//! `AdminClient` trait. The production implementation shells out to the database's own admin
//! tooling, see `CliAdminClient`.

mod cli;
#[cfg(test)]
mod cli_test;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::process_group::ProcessGroupId;

pub use cli::{remove_warnings_in_json, AdminConfig, CliAdminClient, ClusterStatus, DatabaseStatus, ProcessRole, ProcessStatus};

/// Administrative operations against a running database cluster.
///
/// Failures are returned as `anyhow::Error` carrying a `ReconcileError::Collaborator` with any
/// output captured from the underlying tool.
#[async_trait::async_trait]
pub trait AdminClient: Send + Sync {
    /// Exclude the given process groups, so that they shed their data and roles.
    ///
    /// This does not wait for the exclusion to complete, see `exclusions_in_progress`.
    async fn exclude(&self, ids: &[ProcessGroupId]) -> Result<()>;

    /// Re-include the given process groups, clearing any exclusion on them.
    async fn include(&self, ids: &[ProcessGroupId]) -> Result<()>;

    /// Of the given process groups, those which still hold data or roles in the database.
    async fn exclusions_in_progress(&self, ids: &[ProcessGroupId]) -> Result<Vec<ProcessGroupId>>;

    /// Start a continuous backup to the given destination.
    async fn start_backup(&self, url: &str, snapshot_period_seconds: u32) -> Result<()>;

    /// Stop the running backup.
    async fn stop_backup(&self) -> Result<()>;

    /// Pause the backup agents.
    async fn pause_backups(&self) -> Result<()>;

    /// Resume paused backup agents.
    async fn resume_backups(&self) -> Result<()>;

    /// Update the snapshot period of the running backup.
    async fn modify_backup(&self, snapshot_period_seconds: u32) -> Result<()>;

    /// Get the status of the current backup.
    async fn get_backup_status(&self) -> Result<LiveBackupStatus>;
}

/// The live status of a cluster's backup, as reported by the backup tool.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveBackupStatus {
    /// The destination of the backup.
    #[serde(rename = "DestinationURL", default)]
    pub destination_url: String,
    /// The target duration of a complete snapshot.
    #[serde(rename = "SnapshotIntervalSeconds", default)]
    pub snapshot_interval_seconds: u32,
    #[serde(rename = "Status", default)]
    pub status: LiveBackupStatusState,
    /// Whether the backup agents are paused.
    #[serde(rename = "BackupAgentsPaused", default)]
    pub backup_agents_paused: bool,
}

/// The state of a live backup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveBackupStatusState {
    /// Whether the backup is running.
    #[serde(rename = "Running", default)]
    pub running: bool,
}
