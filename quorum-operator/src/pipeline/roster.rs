use std::collections::BTreeSet;

use anyhow::{Context, Result};

use crate::pipeline::{PassContext, StepResult, Subreconciler};
use crate::recorder::EventType;
use crate::units::UnitSelector;
use quorum_core::crd::{DatabaseCluster, ProcessGroupStatus, RequiredMetadata};
use quorum_core::{ProcessClass, ProcessGroupId, ReconcileError};

/// The reason recorded for removals found flagged in the roster without one.
pub(super) const REASON_FLAGGED: &str = "flagged for removal";

/// Bring the roster in line with the live units of the cluster.
///
/// Units carrying a process group ID unknown to the roster are registered, removal flags and
/// pending removals are synced, and roster entries without a unit are reported for repair.
pub struct UpdateRoster;

#[async_trait::async_trait]
impl Subreconciler for UpdateRoster {
    fn name(&self) -> &'static str {
        "UpdateRoster"
    }

    async fn reconcile(&self, ctx: &PassContext, cluster: &mut DatabaseCluster) -> StepResult {
        self.update_roster(ctx, cluster).await.into()
    }
}

impl UpdateRoster {
    #[tracing::instrument(level = "debug", skip(self, ctx, cluster), fields(cluster = %cluster.name()))]
    async fn update_roster(&self, ctx: &PassContext, cluster: &mut DatabaseCluster) -> Result<StepResult> {
        let units = ctx.units.list_units(cluster, &UnitSelector::all()).await.context("error listing units")?;
        let generation = cluster.generation();

        // Register units which the roster does not know about yet.
        let known: BTreeSet<String> = cluster.process_groups().iter().map(|group| group.process_group_id.clone()).collect();
        let mut discovered = Vec::new();
        let mut invalid = Vec::new();
        for unit in &units {
            let raw_id = match unit.process_group_id.as_deref() {
                Some(raw_id) if !known.contains(raw_id) => raw_id,
                _ => continue,
            };
            let id = match ProcessGroupId::parse(raw_id) {
                Ok(id) => id,
                Err(err) => {
                    tracing::warn!(unit = %unit.name, error = %err, "skipping unit with invalid process group ID");
                    invalid.push(err);
                    continue;
                }
            };
            let class = ProcessClass::new(unit.process_class.clone().unwrap_or_else(|| id.class().to_string()));
            tracing::info!(process_group = %id, %class, "registering unit unknown to the roster");
            discovered.push(ProcessGroupStatus::new(&id, &class));
        }
        for err in invalid {
            ctx.recorder.record(cluster, EventType::Warning, err.reason(), &err.to_string()).await;
        }

        let status = cluster.status_mut();
        status.process_groups.extend(discovered);
        status.process_groups.sort_by(|a, b| a.process_group_id.cmp(&b.process_group_id));
        status.process_groups.dedup_by(|a, b| a.process_group_id == b.process_group_id);

        // Keep removal flags and pending removals in sync, dropping orphaned removals.
        let roster_ids: BTreeSet<String> = status.process_groups.iter().map(|group| group.process_group_id.clone()).collect();
        status.pending_removals.retain(|id, _| roster_ids.contains(id));
        for group in status.process_groups.iter_mut() {
            if status.pending_removals.contains_key(&group.process_group_id) {
                group.remove = true;
            } else if group.remove {
                status.pending_removals.insert(group.process_group_id.clone(), REASON_FLAGGED.into());
            }
        }

        // Report retained groups which have lost their unit. These are repaired by `AddUnits`.
        let live: BTreeSet<&str> = units.iter().filter_map(|unit| unit.process_group_id.as_deref()).collect();
        let missing: Vec<String> = status
            .process_groups
            .iter()
            .filter(|group| !group.remove && !live.contains(group.process_group_id.as_str()))
            .map(|group| group.process_group_id.clone())
            .collect();
        if !missing.is_empty() {
            status.generations.missing_units = Some(generation);
            for id in missing {
                let err = ReconcileError::Consistency(id);
                tracing::warn!(error = %err, "roster drift detected");
            }
        }

        Ok(StepResult::Advance)
    }
}
