//! An admin client backed by the database's command line tools.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::process::Command;

use super::{AdminClient, LiveBackupStatus};
use crate::crd::{DatabaseCluster, RequiredMetadata};
use crate::error::ReconcileError;
use crate::process_group::{process_group_id_from_process_id, ProcessGroupId};

/// The locality key under which processes report their process group ID.
const LOCALITY_INSTANCE_ID: &str = "instance_id";
/// The locality key under which processes report their process ID.
const LOCALITY_PROCESS_ID: &str = "process_id";

/// Settings shared by all CLI admin clients.
#[derive(Clone, Debug)]
pub struct AdminConfig {
    /// The database admin binary, e.g. `fdbcli`.
    pub admin_binary: String,
    /// The backup binary, e.g. `fdbbackup`.
    pub backup_binary: String,
    /// The directory where cluster files are written.
    pub cluster_file_dir: PathBuf,
    /// The deadline applied to each invocation of a tool.
    pub timeout: Duration,
}

/// An admin client for a single cluster, which runs the admin tools against its cluster file.
#[derive(Clone, Debug)]
pub struct CliAdminClient {
    config: AdminConfig,
    cluster_file: PathBuf,
    connection_string: Option<String>,
}

impl CliAdminClient {
    /// Create a new instance.
    pub fn new(config: AdminConfig, cluster_file: PathBuf, connection_string: Option<String>) -> Self {
        Self {
            config,
            cluster_file,
            connection_string,
        }
    }

    /// Create a client for the given cluster, using the connection string from its status.
    ///
    /// A cluster which has no connection string yet gets a client whose every command fails.
    pub fn for_cluster(config: &AdminConfig, cluster: &DatabaseCluster) -> Self {
        let connection_string = cluster
            .status
            .as_ref()
            .and_then(|status| status.connection_string.clone())
            .filter(|val| !val.is_empty());
        let cluster_file = config.cluster_file_dir.join(format!("{}-{}.cluster", cluster.namespace(), cluster.name()));
        Self::new(config.clone(), cluster_file, connection_string)
    }

    /// Run the given admin command, e.g. `exclude no_wait ...`, returning its stdout.
    async fn run_admin(&self, command: &str) -> Result<String> {
        let timeout = self.config.timeout.as_secs().max(1).to_string();
        let args = ["--exec", command, "--timeout", timeout.as_str()];
        self.run_command(&self.config.admin_binary, &args).await
    }

    /// Run the given backup subcommand, returning its stdout.
    async fn run_backup(&self, subcommand: &str, args: &[&str]) -> Result<String> {
        let mut full_args = vec![subcommand];
        full_args.extend_from_slice(args);
        self.run_command(&self.config.backup_binary, &full_args).await
    }

    #[tracing::instrument(level = "debug", skip(self), fields(cluster_file = %self.cluster_file.display()))]
    async fn run_command(&self, binary: &str, args: &[&str]) -> Result<String> {
        self.write_cluster_file().await?;
        let description = format!("{} {}", binary, args.first().copied().unwrap_or_default());

        let mut cmd = Command::new(binary);
        cmd.args(args)
            .arg("-C")
            .arg(&self.cluster_file)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let output = tokio::time::timeout(self.config.timeout, cmd.output())
            .await
            .map_err(|_| ReconcileError::collaborator(format!("timeout running {}", description)))?
            .map_err(|err| ReconcileError::collaborator(format!("error running {}: {}", description, err)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::debug!(%description, status = ?output.status, %stderr, "admin command failed");
            return Err(ReconcileError::collaborator_with_output(
                format!("error running {}, {}", description, output.status),
                format!("{}{}", stderr, stdout),
            )
            .into());
        }
        Ok(stdout)
    }

    /// Write the cluster file if it does not already hold the current connection string.
    pub(crate) async fn write_cluster_file(&self) -> Result<()> {
        let connection_string = self
            .connection_string
            .as_deref()
            .ok_or_else(|| ReconcileError::collaborator(format!("no connection string known for cluster file {}", self.cluster_file.display())))?;
        if let Ok(current) = tokio::fs::read_to_string(&self.cluster_file).await {
            if current.trim() == connection_string {
                return Ok(());
            }
        }
        if let Some(parent) = self.cluster_file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("error creating cluster file dir {}", parent.display()))?;
        }
        tokio::fs::write(&self.cluster_file, connection_string)
            .await
            .with_context(|| format!("error writing cluster file {}", self.cluster_file.display()))
    }

    /// Get the machine readable status of the database.
    pub async fn get_status(&self) -> Result<DatabaseStatus> {
        let raw = self.run_admin("status json").await?;
        DatabaseStatus::decode(&raw)
    }
}

#[async_trait::async_trait]
impl AdminClient for CliAdminClient {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn exclude(&self, ids: &[ProcessGroupId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.run_admin(&format!("exclude no_wait {}", locality_args(ids))).await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn include(&self, ids: &[ProcessGroupId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.run_admin(&format!("include {}", locality_args(ids))).await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn exclusions_in_progress(&self, ids: &[ProcessGroupId]) -> Result<Vec<ProcessGroupId>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let status = self.get_status().await?;
        Ok(status.exclusions_in_progress(ids))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn start_backup(&self, url: &str, snapshot_period_seconds: u32) -> Result<()> {
        let period = snapshot_period_seconds.to_string();
        self.run_backup("start", &["-d", url, "-s", period.as_str(), "-z"]).await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn stop_backup(&self) -> Result<()> {
        self.run_backup("discontinue", &[]).await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn pause_backups(&self) -> Result<()> {
        self.run_backup("pause", &[]).await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn resume_backups(&self) -> Result<()> {
        self.run_backup("resume", &[]).await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn modify_backup(&self, snapshot_period_seconds: u32) -> Result<()> {
        let period = snapshot_period_seconds.to_string();
        self.run_backup("modify", &["-s", period.as_str()]).await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_backup_status(&self) -> Result<LiveBackupStatus> {
        let raw = self.run_backup("status", &["--json"]).await?;
        decode_json(&raw, "backup status")
    }
}

/// Render the given IDs as locality selectors for `exclude` and `include`.
fn locality_args(ids: &[ProcessGroupId]) -> String {
    ids.iter()
        .map(|id| format!("locality_{}:{}", LOCALITY_INSTANCE_ID, id))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Strip any non-JSON lines which the admin tools print ahead of a JSON document.
///
/// The document is taken to start at the first line beginning with `{`.
pub fn remove_warnings_in_json(raw: &str) -> Result<&str, ReconcileError> {
    let mut offset = 0;
    for line in raw.split_inclusive('\n') {
        if line.trim_start().starts_with('{') {
            return Ok(raw[offset..].trim_start());
        }
        offset += line.len();
    }
    Err(ReconcileError::collaborator_with_output("the output does not contain a JSON document", raw))
}

fn decode_json<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> Result<T> {
    let json = remove_warnings_in_json(raw)?;
    serde_json::from_str(json).map_err(|err| ReconcileError::collaborator_with_output(format!("error decoding {}: {}", what, err), raw).into())
}

/// The subset of the database's machine readable status used by the operator.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DatabaseStatus {
    #[serde(default)]
    pub cluster: ClusterStatus,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ClusterStatus {
    /// All processes of the cluster, keyed by an opaque process key.
    #[serde(default)]
    pub processes: BTreeMap<String, ProcessStatus>,
}

/// The status of a single database process.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ProcessStatus {
    #[serde(default)]
    pub locality: BTreeMap<String, String>,
    #[serde(default)]
    pub excluded: bool,
    #[serde(default)]
    pub roles: Vec<ProcessRole>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ProcessRole {
    #[serde(default)]
    pub role: String,
}

impl DatabaseStatus {
    /// Decode the output of `status json`, which may be preceded by warning lines.
    pub fn decode(raw: &str) -> Result<Self> {
        decode_json(raw, "database status")
    }

    /// Of the given process groups, those with a process which is either not yet excluded or
    /// which still holds roles.
    ///
    /// Groups with no process reported in the status have nothing left to move.
    pub fn exclusions_in_progress(&self, ids: &[ProcessGroupId]) -> Vec<ProcessGroupId> {
        let wanted: BTreeSet<String> = ids.iter().map(|id| id.to_string()).collect();
        let mut pending = BTreeSet::new();
        for process in self.cluster.processes.values() {
            let group_id = match process.process_group_id() {
                Some(group_id) => group_id,
                None => continue,
            };
            if !wanted.contains(group_id) {
                continue;
            }
            if !process.excluded || !process.roles.is_empty() {
                pending.insert(group_id.to_string());
            }
        }
        ids.iter().filter(|id| pending.contains(&id.to_string())).cloned().collect()
    }
}

impl ProcessStatus {
    /// The process group this process belongs to, from its locality.
    pub fn process_group_id(&self) -> Option<&str> {
        self.locality
            .get(LOCALITY_INSTANCE_ID)
            .map(String::as_str)
            .or_else(|| self.locality.get(LOCALITY_PROCESS_ID).map(|val| process_group_id_from_process_id(val)))
    }
}
