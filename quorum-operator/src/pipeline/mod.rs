//! The reconciliation pipeline.
//!
//! A pass runs a fixed, ordered list of subreconcilers against a private snapshot of a cluster.
//! Each subreconciler owns one operational concern, recomputes what needs to change from the
//! current and desired state, and is a no-op when nothing does. A pass may be interrupted after
//! any step and is always resumed from the first step, so no step may assume that the side
//! effects of an earlier, interrupted pass did not happen.
//!
//! The order is load-bearing:
//! - sidecar upgrades run before the database version is rolled out;
//! - the version rollout completes for all retained process groups before any exclusion;
//! - exclusion is confirmed for all groups being removed before any of their units is deleted.

mod add_units;
mod backup;
mod exclude;
mod remove;
mod roster;
mod safety;
mod scale;
mod sidecar;
mod versions;


use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::recorder::EventRecorder;
use crate::units::UnitManager;
use quorum_core::admin::AdminClient;
use quorum_core::crd::{DatabaseCluster, RequiredMetadata};

pub use add_units::AddUnits;
pub use backup::ReconcileBackup;
pub use exclude::ExcludeProcessGroups;
pub use remove::RemoveProcessGroups;
pub use roster::UpdateRoster;
pub use scale::UpdateProcessGroups;
pub use sidecar::UpdateSidecarVersions;
pub use versions::ReplaceOutdatedUnits;

/// The collaborators available to a reconciliation pass.
#[derive(Clone)]
pub struct PassContext {
    pub units: Arc<dyn UnitManager>,
    pub admin: Arc<dyn AdminClient>,
    pub recorder: Arc<dyn EventRecorder>,
}

/// The outcome of a single subreconciler.
#[derive(Debug)]
pub enum StepResult {
    /// The step is complete, continue with the next step.
    Advance,
    /// External state prevents progress. The rest of the pass is skipped and retried later.
    Blocked(String),
    /// The step failed. The pass is retried from the start with backoff.
    Fail(anyhow::Error),
}

impl From<Result<StepResult>> for StepResult {
    fn from(res: Result<StepResult>) -> Self {
        res.unwrap_or_else(StepResult::Fail)
    }
}

/// A single idempotent unit of reconciliation logic.
#[async_trait::async_trait]
pub trait Subreconciler: Send + Sync {
    /// The name of this step, used in logs and events.
    fn name(&self) -> &'static str;

    /// Move the given cluster snapshot towards its desired state.
    async fn reconcile(&self, ctx: &PassContext, cluster: &mut DatabaseCluster) -> StepResult;

    /// The minimum delay before a pass blocked on this step is retried.
    fn requeue_after(&self) -> Duration {
        Duration::from_secs(0)
    }
}

/// The outcome of a full reconciliation pass.
#[derive(Debug)]
pub enum PassOutcome {
    /// Every step advanced.
    Complete,
    /// The step at the given index was blocked.
    Blocked {
        index: usize,
        step: &'static str,
        reason: String,
        requeue_after: Duration,
    },
    /// The step at the given index failed.
    Failed { index: usize, step: &'static str, error: anyhow::Error },
}

impl PassOutcome {
    /// The label under which this outcome is counted in metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Blocked { .. } => "blocked",
            Self::Failed { .. } => "failed",
        }
    }
}

/// A fixed, ordered list of subreconcilers.
pub struct Pipeline {
    steps: Vec<Box<dyn Subreconciler>>,
}

impl Pipeline {
    /// Create a new instance with the given steps.
    pub fn new(steps: Vec<Box<dyn Subreconciler>>) -> Self {
        Self { steps }
    }

    /// The standard pipeline used for all clusters.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(UpdateRoster),
            Box::new(UpdateProcessGroups),
            Box::new(AddUnits),
            Box::new(UpdateSidecarVersions),
            Box::new(ReplaceOutdatedUnits),
            Box::new(ExcludeProcessGroups),
            Box::new(RemoveProcessGroups),
            Box::new(ReconcileBackup),
        ])
    }

    /// The names of the steps of this pipeline, in order.
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    /// Run a full pass against the given cluster snapshot.
    ///
    /// Outstanding generation markers are cleared up front and set again by whichever steps
    /// still find work to do. On completion the cluster's generation is recorded as reconciled.
    #[tracing::instrument(level = "debug", skip(self, ctx, cluster), fields(cluster = %cluster.name(), generation = cluster.generation()))]
    pub async fn run(&self, ctx: &PassContext, cluster: &mut DatabaseCluster) -> PassOutcome {
        let generation = cluster.generation();
        cluster.status_mut().generations.clear_outstanding();

        for (index, step) in self.steps.iter().enumerate() {
            tracing::debug!(index, step = step.name(), "running step");
            match step.reconcile(ctx, cluster).await {
                StepResult::Advance => continue,
                StepResult::Blocked(reason) => {
                    tracing::debug!(index, step = step.name(), %reason, "step blocked");
                    return PassOutcome::Blocked {
                        index,
                        step: step.name(),
                        reason,
                        requeue_after: step.requeue_after(),
                    };
                }
                StepResult::Fail(error) => {
                    tracing::debug!(index, step = step.name(), error = ?error, "step failed");
                    return PassOutcome::Failed { index, step: step.name(), error };
                }
            }
        }

        cluster.status_mut().generations.reconciled = Some(generation);
        PassOutcome::Complete
    }
}
