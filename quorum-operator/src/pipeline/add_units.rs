use anyhow::{Context, Result};

use crate::pipeline::{PassContext, StepResult, Subreconciler};
use crate::recorder::EventType;
use crate::units::{units_by_process_group, UnitSelector};
use quorum_core::crd::{DatabaseCluster, RequiredMetadata};

/// Create units for retained process groups which have none.
///
/// This covers both newly allocated groups and groups whose unit was lost or deleted during a
/// version rollout.
pub struct AddUnits;

#[async_trait::async_trait]
impl Subreconciler for AddUnits {
    fn name(&self) -> &'static str {
        "AddUnits"
    }

    async fn reconcile(&self, ctx: &PassContext, cluster: &mut DatabaseCluster) -> StepResult {
        self.add_units(ctx, cluster).await.into()
    }
}

impl AddUnits {
    #[tracing::instrument(level = "debug", skip(self, ctx, cluster), fields(cluster = %cluster.name()))]
    async fn add_units(&self, ctx: &PassContext, cluster: &mut DatabaseCluster) -> Result<StepResult> {
        let units = ctx.units.list_units(cluster, &UnitSelector::all()).await.context("error listing units")?;
        let index = units_by_process_group(&units);
        let missing: Vec<_> = cluster
            .process_groups()
            .iter()
            .filter(|group| !group.remove && !index.contains_key(group.process_group_id.as_str()))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(StepResult::Advance);
        }

        for group in &missing {
            tracing::info!(process_group = %group.process_group_id, "creating unit for process group");
            ctx.units
                .create_unit(cluster, group)
                .await
                .with_context(|| format!("error creating unit for process group {}", group.process_group_id))?;
        }
        let names = missing.iter().map(|group| group.process_group_id.as_str()).collect::<Vec<_>>().join(", ");
        ctx.recorder
            .record(cluster, EventType::Normal, "AddedUnits", &format!("Created units for process groups: {}", names))
            .await;
        Ok(StepResult::Advance)
    }
}
