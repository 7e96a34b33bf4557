use std::collections::BTreeSet;

use anyhow::Result;

use crate::pipeline::{PassContext, StepResult, Subreconciler};
use quorum_core::crd::{DatabaseCluster, DatabaseClusterStatus, ProcessGroupStatus, RequiredMetadata};
use quorum_core::{ProcessClass, ProcessGroupId};

/// The pending removal reason of groups removed on request.
pub(super) const REASON_REQUESTED: &str = "removal requested in spec";
/// The pending removal reason of groups removed to scale down.
pub(super) const REASON_SCALE_DOWN: &str = "scaled down";

/// Reconcile the roster against the desired process counts.
///
/// Explicit removal requests are honored first. Each class is then scaled up by allocating the
/// next free indices, or scaled down by marking the groups with the highest indices for removal.
/// Groups marked for removal no longer count towards the desired counts, so removed groups are
/// replaced.
pub struct UpdateProcessGroups;

#[async_trait::async_trait]
impl Subreconciler for UpdateProcessGroups {
    fn name(&self) -> &'static str {
        "UpdateProcessGroups"
    }

    async fn reconcile(&self, _ctx: &PassContext, cluster: &mut DatabaseCluster) -> StepResult {
        self.update_process_groups(cluster).into()
    }
}

impl UpdateProcessGroups {
    #[tracing::instrument(level = "debug", skip(self, cluster), fields(cluster = %cluster.name()))]
    fn update_process_groups(&self, cluster: &mut DatabaseCluster) -> Result<StepResult> {
        let requested: BTreeSet<String> = cluster.spec.process_groups_to_remove.iter().cloned().collect();
        let prefix = cluster.spec.process_group_id_prefix.clone();
        let mut classes: BTreeSet<String> = cluster.spec.process_counts.keys().cloned().collect();
        classes.extend(cluster.process_groups().iter().map(|group| group.process_class.clone()));
        let desired: Vec<(ProcessClass, usize)> = classes
            .into_iter()
            .map(|class| {
                let class = ProcessClass::new(class);
                let want = cluster.desired_count(&class) as usize;
                (class, want)
            })
            .collect();
        let status = cluster.status_mut();

        for group in status.process_groups.iter_mut() {
            if requested.contains(&group.process_group_id) && !group.remove {
                tracing::info!(process_group = %group.process_group_id, "marking process group for removal on request");
                group.remove = true;
                status.pending_removals.insert(group.process_group_id.clone(), REASON_REQUESTED.into());
            }
        }

        for (class, want) in desired {
            let active = status.process_groups.iter().filter(|group| !group.remove && group.process_class == class.as_str()).count();
            if active < want {
                scale_up(status, prefix.as_deref(), &class, want - active);
            } else if active > want {
                scale_down(status, &class, active - want);
            }
        }

        status.process_groups.sort_by(|a, b| a.process_group_id.cmp(&b.process_group_id));
        Ok(StepResult::Advance)
    }
}

/// Add `count` new process groups of the given class, using the lowest free indices.
///
/// Indices held by groups still pending removal are not reused.
fn scale_up(status: &mut DatabaseClusterStatus, prefix: Option<&str>, class: &ProcessClass, count: usize) {
    let template = ProcessGroupId::new(prefix, class, 0);
    let used: BTreeSet<u32> = status
        .process_groups
        .iter()
        .filter_map(|group| group.id().ok())
        .filter(|id| id.class() == template.class())
        .map(|id| id.index())
        .collect();
    let mut next = 1;
    for _ in 0..count {
        while used.contains(&next) {
            next += 1;
        }
        let id = ProcessGroupId::new(prefix, class, next);
        tracing::info!(process_group = %id, "adding process group");
        status.process_groups.push(ProcessGroupStatus::new(&id, class));
        next += 1;
    }
}

/// Mark the `count` retained process groups of the given class with the highest indices for removal.
fn scale_down(status: &mut DatabaseClusterStatus, class: &ProcessClass, count: usize) {
    let mut candidates: Vec<(u32, String)> = status
        .process_groups
        .iter()
        .filter(|group| !group.remove && group.process_class == class.as_str())
        .map(|group| (group.id().map(|id| id.index()).unwrap_or(u32::MAX), group.process_group_id.clone()))
        .collect();
    candidates.sort();
    let marked: BTreeSet<String> = candidates.into_iter().rev().take(count).map(|(_, id)| id).collect();
    for group in status.process_groups.iter_mut().filter(|group| marked.contains(&group.process_group_id)) {
        tracing::info!(process_group = %group.process_group_id, "marking process group for removal to scale down");
        group.remove = true;
        status.pending_removals.insert(group.process_group_id.clone(), REASON_SCALE_DOWN.into());
    }
}
