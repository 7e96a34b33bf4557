use std::time::Duration;

use anyhow::{Context, Result};

use crate::pipeline::safety::{is_available, SafetyBudget};
use crate::pipeline::{PassContext, StepResult, Subreconciler};
use crate::recorder::EventType;
use crate::units::{units_by_process_group, UnitSelector};
use quorum_core::crd::{DatabaseCluster, RequiredMetadata};
use quorum_core::ProcessGroupId;

/// Exclude process groups marked for removal from the database.
///
/// Exclusions are admitted by the fault tolerance budget of each class. Groups refused by the
/// budget are excluded on a later pass, once earlier exclusions have been removed.
pub struct ExcludeProcessGroups;

#[async_trait::async_trait]
impl Subreconciler for ExcludeProcessGroups {
    fn name(&self) -> &'static str {
        "ExcludeProcessGroups"
    }

    async fn reconcile(&self, ctx: &PassContext, cluster: &mut DatabaseCluster) -> StepResult {
        self.exclude_process_groups(ctx, cluster).await.into()
    }

    fn requeue_after(&self) -> Duration {
        Duration::from_secs(5)
    }
}

impl ExcludeProcessGroups {
    #[tracing::instrument(level = "debug", skip(self, ctx, cluster), fields(cluster = %cluster.name()))]
    async fn exclude_process_groups(&self, ctx: &PassContext, cluster: &mut DatabaseCluster) -> Result<StepResult> {
        let mut candidates: Vec<_> = cluster.process_groups().iter().filter(|group| group.remove && !group.excluded).cloned().collect();
        if candidates.is_empty() {
            return Ok(StepResult::Advance);
        }
        candidates.sort_by(|a, b| a.process_group_id.cmp(&b.process_group_id));
        let generation = cluster.generation();
        cluster.status_mut().generations.needs_exclusion = Some(generation);

        let units = ctx.units.list_units(cluster, &UnitSelector::all()).await.context("error listing units")?;
        let index = units_by_process_group(&units);
        let mut budget = SafetyBudget::compute(cluster, &units);
        let (mut selected, mut refused) = (Vec::new(), Vec::new());
        for group in candidates {
            let unit = index.get(group.process_group_id.as_str()).copied();
            if budget.admit(&group.process_class, is_available(&group, unit)) {
                selected.push(group);
            } else {
                refused.push(group);
            }
        }

        if !selected.is_empty() {
            let ids = selected.iter().map(|group| group.id()).collect::<Result<Vec<ProcessGroupId>, _>>()?;
            tracing::info!(count = ids.len(), "excluding process groups");
            ctx.admin.exclude(&ids).await.context("error excluding process groups")?;

            let status = cluster.status_mut();
            for group in status.process_groups.iter_mut() {
                if selected.iter().any(|selected| selected.process_group_id == group.process_group_id) {
                    group.excluded = true;
                }
            }
            let names = selected.iter().map(|group| group.process_group_id.as_str()).collect::<Vec<_>>().join(", ");
            ctx.recorder
                .record(cluster, EventType::Normal, "ExcludedProcessGroups", &format!("Excluded process groups: {}", names))
                .await;
        }

        if refused.is_empty() {
            return Ok(StepResult::Advance);
        }
        if !selected.is_empty() {
            return Ok(StepResult::Blocked(format!(
                "excluded {} process group(s), {} more waiting on the fault tolerance budget",
                selected.len(),
                refused.len()
            )));
        }
        let class = refused[0].process_class.clone();
        let requested = refused.iter().filter(|group| group.process_class == class).count();
        match budget.refusal(&class, requested) {
            Ok(reason) => Ok(StepResult::Blocked(reason)),
            Err(err) => Err(err.into()),
        }
    }
}
