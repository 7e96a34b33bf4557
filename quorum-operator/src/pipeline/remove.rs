use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::pipeline::{PassContext, StepResult, Subreconciler};
use crate::recorder::EventType;
use crate::units::UnitSelector;
use quorum_core::crd::{DatabaseCluster, RequiredMetadata};
use quorum_core::ProcessGroupId;

/// Remove excluded process groups from the cluster.
///
/// A group is removed only once the database confirms that it holds no more data or roles. Its
/// unit is deleted, and once the unit is gone the exclusion is cleared and the group leaves the
/// roster.
pub struct RemoveProcessGroups;

#[async_trait::async_trait]
impl Subreconciler for RemoveProcessGroups {
    fn name(&self) -> &'static str {
        "RemoveProcessGroups"
    }

    async fn reconcile(&self, ctx: &PassContext, cluster: &mut DatabaseCluster) -> StepResult {
        self.remove_process_groups(ctx, cluster).await.into()
    }

    fn requeue_after(&self) -> Duration {
        Duration::from_secs(10)
    }
}

impl RemoveProcessGroups {
    #[tracing::instrument(level = "debug", skip(self, ctx, cluster), fields(cluster = %cluster.name()))]
    async fn remove_process_groups(&self, ctx: &PassContext, cluster: &mut DatabaseCluster) -> Result<StepResult> {
        let removable: Vec<_> = cluster.process_groups().iter().filter(|group| group.remove && group.excluded).cloned().collect();
        if removable.is_empty() {
            return Ok(StepResult::Advance);
        }
        let generation = cluster.generation();
        cluster.status_mut().generations.needs_removal = Some(generation);
        let ids = removable.iter().map(|group| group.id()).collect::<Result<Vec<ProcessGroupId>, _>>()?;

        // Exclusion must be complete before any unit goes away.
        let in_progress = ctx
            .admin
            .exclusions_in_progress(&ids)
            .await
            .context("error checking exclusion progress")?;
        if !in_progress.is_empty() {
            let names = in_progress.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
            return Ok(StepResult::Blocked(format!("waiting for exclusion of process groups: {}", names)));
        }

        let selector = UnitSelector::process_groups(removable.iter().map(|group| group.process_group_id.clone()));
        let units = ctx.units.list_units(cluster, &selector).await.context("error listing units")?;
        for unit in units.iter().filter(|unit| !unit.terminating) {
            tracing::info!(unit = %unit.name, "deleting unit of excluded process group");
            ctx.units
                .delete_unit(unit)
                .await
                .with_context(|| format!("error deleting unit {}", unit.name))?;
        }
        if !units.is_empty() {
            let remaining = ctx.units.list_units(cluster, &selector).await.context("error listing units")?;
            if !remaining.is_empty() {
                return Ok(StepResult::Blocked(format!("waiting for {} unit(s) to be deleted", remaining.len())));
            }
        }

        ctx.admin.include(&ids).await.context("error including removed process groups")?;
        let removed: BTreeSet<String> = removable.into_iter().map(|group| group.process_group_id).collect();
        let status = cluster.status_mut();
        status.process_groups.retain(|group| !removed.contains(&group.process_group_id));
        status.pending_removals.retain(|id, _| !removed.contains(id));
        let names = removed.iter().map(String::as_str).collect::<Vec<_>>().join(", ");
        tracing::info!(process_groups = %names, "removed process groups");
        ctx.recorder
            .record(cluster, EventType::Normal, "RemovedProcessGroups", &format!("Removed process groups: {}", names))
            .await;
        Ok(StepResult::Advance)
    }
}
