use anyhow::{Context, Result};

use crate::pipeline::{PassContext, StepResult, Subreconciler};
use crate::recorder::EventType;
use crate::units::{units_by_process_group, UnitSelector, CONTAINER_SIDECAR};
use quorum_core::crd::{DatabaseCluster, RequiredMetadata};

/// Upgrade the sidecar container of retained units in place.
pub struct UpdateSidecarVersions;

#[async_trait::async_trait]
impl Subreconciler for UpdateSidecarVersions {
    fn name(&self) -> &'static str {
        "UpdateSidecarVersions"
    }

    async fn reconcile(&self, ctx: &PassContext, cluster: &mut DatabaseCluster) -> StepResult {
        self.update_sidecar_versions(ctx, cluster).await.into()
    }
}

impl UpdateSidecarVersions {
    #[tracing::instrument(level = "debug", skip(self, ctx, cluster), fields(cluster = %cluster.name()))]
    async fn update_sidecar_versions(&self, ctx: &PassContext, cluster: &mut DatabaseCluster) -> Result<StepResult> {
        let units = ctx.units.list_units(cluster, &UnitSelector::all()).await.context("error listing units")?;
        let index = units_by_process_group(&units);
        let version = cluster.sidecar_version();

        let mut missing = Vec::new();
        let mut upgraded = 0;
        for group in cluster.process_groups().iter().filter(|group| !group.remove) {
            let unit = match index.get(group.process_group_id.as_str()) {
                Some(unit) => *unit,
                None => {
                    missing.push(group.process_group_id.clone());
                    continue;
                }
            };
            let container_index = match unit.container_index(CONTAINER_SIDECAR) {
                Some(container_index) => container_index,
                None => {
                    tracing::warn!(unit = %unit.name, "unit has no sidecar container");
                    continue;
                }
            };
            let image = cluster.sidecar_image(&group.class())?;
            if unit.containers[container_index].image == image {
                continue;
            }

            tracing::info!(unit = %unit.name, %image, "upgrading sidecar container");
            ctx.units
                .update_image(unit, container_index, &image)
                .await
                .with_context(|| format!("error upgrading sidecar of unit {}", unit.name))?;
            upgraded += 1;
        }

        if upgraded > 0 {
            let generation = cluster.generation();
            cluster.status_mut().generations.needs_sidecar_upgrade = Some(generation);
            ctx.recorder
                .record(cluster, EventType::Normal, "SidecarUpgraded", &format!("New version: {}", version))
                .await;
        }
        if !missing.is_empty() {
            return Ok(StepResult::Blocked(format!("waiting for units of process groups: {}", missing.join(", "))));
        }
        Ok(StepResult::Advance)
    }
}
