use std::time::Duration;

use anyhow::{Context, Result};

use crate::pipeline::safety::{is_available, SafetyBudget};
use crate::pipeline::{PassContext, StepResult, Subreconciler};
use crate::recorder::EventType;
use crate::units::{units_by_process_group, UnitSelector, WorkloadUnit, CONTAINER_MAIN};
use quorum_core::crd::{DatabaseCluster, DeletionMode, ProcessGroupStatus, RequiredMetadata};

/// Roll out the desired database version by replacing units running an outdated main image.
///
/// Outdated units are deleted and recreated by `AddUnits` on a later pass. Deletions are paced
/// by the cluster's deletion mode and admitted by the fault tolerance budget. This step blocks
/// until every retained process group runs the desired image.
pub struct ReplaceOutdatedUnits;

#[async_trait::async_trait]
impl Subreconciler for ReplaceOutdatedUnits {
    fn name(&self) -> &'static str {
        "ReplaceOutdatedUnits"
    }

    async fn reconcile(&self, ctx: &PassContext, cluster: &mut DatabaseCluster) -> StepResult {
        self.replace_outdated_units(ctx, cluster).await.into()
    }

    fn requeue_after(&self) -> Duration {
        Duration::from_secs(10)
    }
}

impl ReplaceOutdatedUnits {
    #[tracing::instrument(level = "debug", skip(self, ctx, cluster), fields(cluster = %cluster.name()))]
    async fn replace_outdated_units(&self, ctx: &PassContext, cluster: &mut DatabaseCluster) -> Result<StepResult> {
        let units = ctx.units.list_units(cluster, &UnitSelector::all()).await.context("error listing units")?;
        let index = units_by_process_group(&units);

        let mut outdated: Vec<(ProcessGroupStatus, &WorkloadUnit)> = Vec::new();
        let mut in_flux = Vec::new();
        for group in cluster.process_groups().iter().filter(|group| !group.remove) {
            let unit = match index.get(group.process_group_id.as_str()) {
                Some(unit) => *unit,
                None => {
                    in_flux.push(group.process_group_id.clone());
                    continue;
                }
            };
            let image = cluster.main_image(&group.class())?;
            let is_outdated = unit.image(CONTAINER_MAIN) != Some(image.as_str());
            // An unavailable unit which is itself due for replacement does not hold up the
            // rollout, replacing it may well be what brings it back.
            if !unit.is_available() && (!is_outdated || unit.terminating) {
                in_flux.push(group.process_group_id.clone());
            }
            if is_outdated {
                outdated.push((group.clone(), unit));
            }
        }

        let generation = cluster.generation();
        if outdated.is_empty() {
            if in_flux.is_empty() {
                cluster.status_mut().running_version = Some(cluster.spec.version.clone());
            }
            return Ok(StepResult::Advance);
        }
        cluster.status_mut().generations.needs_version_upgrade = Some(generation);

        // Units already being deleted are on their way out, only the rest are candidates.
        // Unavailable units go first, they cost nothing against the fault tolerance budget.
        let mut candidates: Vec<(ProcessGroupStatus, &WorkloadUnit)> = outdated.into_iter().filter(|(_, unit)| !unit.terminating).collect();
        candidates.sort_by(|(a_group, a_unit), (b_group, b_unit)| {
            (a_unit.is_available(), a_unit.fault_domain.as_str(), a_group.process_group_id.as_str()).cmp(&(
                b_unit.is_available(),
                b_unit.fault_domain.as_str(),
                b_group.process_group_id.as_str(),
            ))
        });
        let mode = ctx.units.deletion_mode(cluster);
        match mode {
            DeletionMode::Zone | DeletionMode::ProcessGroup if !in_flux.is_empty() => {
                return Ok(StepResult::Blocked(format!(
                    "deletion mode {} is waiting for process groups to be replaced: {}",
                    mode,
                    in_flux.join(", ")
                )));
            }
            DeletionMode::Zone => {
                if let Some(zone) = candidates.first().map(|(_, unit)| unit.fault_domain.clone()) {
                    candidates.retain(|(_, unit)| unit.fault_domain == zone);
                }
            }
            DeletionMode::ProcessGroup => candidates.truncate(1),
            DeletionMode::All => (),
        }
        if candidates.is_empty() {
            return Ok(StepResult::Blocked("waiting for outdated units to terminate".into()));
        }

        // Admit deletions against the fault tolerance budget.
        let mut budget = SafetyBudget::compute(cluster, &units);
        let mut selected = Vec::new();
        let mut refused = Vec::new();
        for (group, unit) in candidates {
            if budget.admit(&group.process_class, is_available(&group, Some(unit))) {
                selected.push((group, unit));
            } else {
                refused.push(group);
            }
        }
        if selected.is_empty() {
            let class = refused.first().map(|group| group.process_class.clone()).unwrap_or_default();
            let requested = refused.iter().filter(|group| group.process_class == class).count();
            return match budget.refusal(&class, requested) {
                Ok(reason) => Ok(StepResult::Blocked(reason)),
                Err(err) => Err(err.into()),
            };
        }

        let mut names = Vec::new();
        for (group, unit) in &selected {
            tracing::info!(process_group = %group.process_group_id, unit = %unit.name, "deleting outdated unit");
            ctx.units
                .delete_unit(unit)
                .await
                .with_context(|| format!("error deleting outdated unit {}", unit.name))?;
            names.push(group.process_group_id.as_str());
        }
        ctx.recorder
            .record(
                cluster,
                EventType::Normal,
                "ReplacingUnits",
                &format!("Replacing units to run version {}: {}", cluster.spec.version, names.join(", ")),
            )
            .await;
        Ok(StepResult::Blocked(format!("waiting for {} unit(s) to be replaced", selected.len())))
    }
}
