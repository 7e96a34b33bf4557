//! Process group exclusion.

use anyhow::Result;
use structopt::StructOpt;

use crate::Quorum;
use quorum_core::admin::AdminClient;
use quorum_core::ProcessGroupId;

/// Exclude process groups, so that they shed their data and roles.
///
/// This does not wait for the exclusion to complete, see `exclusion-status`.
#[derive(StructOpt)]
#[structopt(name = "exclude")]
pub struct Exclude {
    /// The IDs of the process groups to exclude, e.g. `storage-1`.
    #[structopt(required = true)]
    pub(crate) ids: Vec<ProcessGroupId>,
}

impl Exclude {
    pub async fn run(&self, base: &Quorum) -> Result<()> {
        tracing::info!(ids = %join_ids(&self.ids), "excluding process groups");
        base.get_client().await?.exclude(&self.ids).await
    }
}

/// Re-include previously excluded process groups.
#[derive(StructOpt)]
#[structopt(name = "include")]
pub struct Include {
    /// The IDs of the process groups to include.
    #[structopt(required = true)]
    ids: Vec<ProcessGroupId>,
}

impl Include {
    pub async fn run(&self, base: &Quorum) -> Result<()> {
        tracing::info!(ids = %join_ids(&self.ids), "including process groups");
        base.get_client().await?.include(&self.ids).await
    }
}

/// Show which of the given process groups still hold data or roles.
#[derive(StructOpt)]
#[structopt(name = "exclusion-status")]
pub struct ExclusionStatus {
    /// The IDs of the process groups to check.
    #[structopt(required = true)]
    ids: Vec<ProcessGroupId>,
}

impl ExclusionStatus {
    pub async fn run(&self, base: &Quorum) -> Result<()> {
        let in_progress = base.get_client().await?.exclusions_in_progress(&self.ids).await?;
        for id in &self.ids {
            let state = if in_progress.contains(id) { "in progress" } else { "complete" };
            println!("{}\t{}", id, state);
        }
        Ok(())
    }
}

fn join_ids(ids: &[ProcessGroupId]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}
