use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};

use crate::pipeline::{PassContext, PassOutcome, Pipeline};
use crate::recorder::{EventRecorder, EventType};
use crate::units::{UnitContainer, UnitManager, UnitSelector, WorkloadUnit, CONTAINER_MAIN, CONTAINER_SIDECAR};
use quorum_core::admin::{AdminClient, LiveBackupStatus};
use quorum_core::crd::{AutomationOptions, DatabaseCluster, DatabaseClusterSpec, ProcessGroupStatus, RequiredMetadata};
use quorum_core::{ProcessGroupId, LABEL_CLUSTER, LABEL_PROCESS_CLASS, LABEL_PROCESS_GROUP_ID};

/// Build a cluster object with the given version and process counts.
pub fn cluster(version: &str, counts: &[(&str, u32)], fault_tolerance: u32) -> DatabaseCluster {
    let spec = DatabaseClusterSpec {
        version: version.into(),
        process_counts: counts.iter().map(|(class, count)| (class.to_string(), *count)).collect(),
        fault_tolerance,
        process_group_id_prefix: None,
        main_container: Default::default(),
        sidecar_container: Default::default(),
        sidecar_build: None,
        process_settings: Default::default(),
        automation_options: AutomationOptions::default(),
        process_groups_to_remove: vec![],
        backup: None,
    };
    let mut cluster = DatabaseCluster::new("test", spec);
    cluster.metadata.namespace = Some("default".into());
    cluster.metadata.generation = Some(1);
    cluster.metadata.uid = Some("3b1e6a52-7c0d-4f7a-9d8e-1f2a3b4c5d6e".into());
    cluster
}

/// Bump the generation of the given cluster, as the API server does on every spec change.
pub fn bump_generation(cluster: &mut DatabaseCluster) {
    cluster.metadata.generation = Some(cluster.generation() + 1);
}

/// Build a pass context over the given fakes.
pub fn context(units: &Arc<FakeUnits>, admin: &Arc<FakeAdmin>, recorder: &Arc<FakeRecorder>) -> PassContext {
    PassContext {
        units: units.clone(),
        admin: admin.clone(),
        recorder: recorder.clone(),
    }
}

/// Run passes until one completes, returning the outcomes of all passes.
///
/// The given hook is called with the cluster before every pass.
pub async fn run_to_completion<F>(pipeline: &Pipeline, ctx: &PassContext, cluster: &mut DatabaseCluster, max_passes: usize, mut before_pass: F) -> Result<Vec<PassOutcome>>
where
    F: FnMut(&DatabaseCluster),
{
    let mut outcomes = Vec::new();
    for _ in 0..max_passes {
        before_pass(cluster);
        let outcome = pipeline.run(ctx, cluster).await;
        let done = matches!(outcome, PassOutcome::Complete);
        if let PassOutcome::Failed { error, step, .. } = &outcome {
            bail!("pass failed in step {}: {:?}", step, error);
        }
        outcomes.push(outcome);
        if done {
            return Ok(outcomes);
        }
    }
    bail!("cluster did not converge within {} passes", max_passes)
}

//////////////////////////////////////////////////////////////////////////////
// Units /////////////////////////////////////////////////////////////////////

/// An in-memory unit manager. Created units are immediately ready.
///
/// Deleted units are immediately gone, unless deletions are deferred, in which case they are
/// marked as terminating until `reap` is called.
#[derive(Default)]
pub struct FakeUnits {
    state: Mutex<FakeUnitsState>,
}

#[derive(Default)]
struct FakeUnitsState {
    units: Vec<WorkloadUnit>,
    /// Side effects, in the order they were applied.
    log: Vec<String>,
    defer_deletions: bool,
    /// Fail all calls the way an unreachable API server does.
    api_down: bool,
}

impl FakeUnits {
    /// Snapshot all units.
    pub fn units(&self) -> Vec<WorkloadUnit> {
        self.lock().units.clone()
    }

    /// Snapshot the side effect log.
    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    /// Set the readiness of the unit of the given process group.
    pub fn set_ready(&self, process_group_id: &str, ready: bool) {
        let mut state = self.lock();
        for unit in state.units.iter_mut().filter(|unit| unit.process_group_id.as_deref() == Some(process_group_id)) {
            unit.ready = ready;
        }
    }

    /// Keep deleted units around as terminating until they are reaped.
    pub fn defer_deletions(&self) {
        self.lock().defer_deletions = true;
    }

    /// Finish the deletion of all terminating units.
    pub fn reap(&self) {
        self.lock().units.retain(|unit| !unit.terminating);
    }

    /// Make all calls fail, or succeed again.
    pub fn set_api_down(&self, down: bool) {
        self.lock().api_down = down;
    }

    /// Fail with the error a real unit manager returns for an unreachable API server.
    fn check_api(&self, action: &str) -> Result<()> {
        if !self.lock().api_down {
            return Ok(());
        }
        let err = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "the server is currently unable to handle the request".into(),
            reason: "ServiceUnavailable".into(),
            code: 503,
        });
        crate::k8s::api_result::<()>(Ok(Err(err)), action)?;
        Ok(())
    }

    /// Insert a unit directly, bypassing the side effect log.
    pub fn insert(&self, unit: WorkloadUnit) {
        self.lock().units.push(unit);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeUnitsState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Build the unit a real cluster would run for the given process group.
pub fn unit_for(cluster: &DatabaseCluster, group: &ProcessGroupStatus) -> Result<WorkloadUnit> {
    let class = group.class();
    let name = crate::k8s::units::unit_name(cluster, group);
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_CLUSTER.to_string(), cluster.name().to_string());
    labels.insert(LABEL_PROCESS_GROUP_ID.to_string(), group.process_group_id.clone());
    labels.insert(LABEL_PROCESS_CLASS.to_string(), group.process_class.clone());
    Ok(WorkloadUnit {
        fault_domain: name.clone(),
        name,
        namespace: cluster.namespace().to_string(),
        process_group_id: Some(group.process_group_id.clone()),
        process_class: Some(group.process_class.clone()),
        containers: vec![
            UnitContainer {
                name: CONTAINER_MAIN.into(),
                image: cluster.main_image(&class)?,
            },
            UnitContainer {
                name: CONTAINER_SIDECAR.into(),
                image: cluster.sidecar_image(&class)?,
            },
        ],
        labels,
        ready: true,
        terminating: false,
    })
}

#[async_trait::async_trait]
impl UnitManager for FakeUnits {
    async fn list_units(&self, _cluster: &DatabaseCluster, selector: &UnitSelector) -> Result<Vec<WorkloadUnit>> {
        self.check_api("listing pods")?;
        Ok(self.lock().units.iter().filter(|unit| selector.matches(unit)).cloned().collect())
    }

    async fn create_unit(&self, cluster: &DatabaseCluster, group: &ProcessGroupStatus) -> Result<()> {
        self.check_api("creating pod")?;
        let unit = unit_for(cluster, group)?;
        let mut state = self.lock();
        if state.units.iter().any(|existing| existing.name == unit.name) {
            bail!("unit {} already exists", unit.name);
        }
        state.log.push(format!("create {}", group.process_group_id));
        state.units.push(unit);
        Ok(())
    }

    async fn update_image(&self, unit: &WorkloadUnit, container_index: usize, image: &str) -> Result<()> {
        self.check_api("patching pod image")?;
        let mut state = self.lock();
        let live = match state.units.iter_mut().find(|live| live.name == unit.name) {
            Some(live) => live,
            None => bail!("unit {} not found", unit.name),
        };
        match live.containers.get_mut(container_index) {
            Some(container) => container.image = image.into(),
            None => bail!("unit {} has no container at index {}", unit.name, container_index),
        }
        let id = unit.process_group_id.clone().unwrap_or_default();
        state.log.push(format!("update_image {} {}", id, image));
        Ok(())
    }

    async fn delete_unit(&self, unit: &WorkloadUnit) -> Result<()> {
        self.check_api("deleting pod")?;
        let mut state = self.lock();
        if state.defer_deletions {
            for live in state.units.iter_mut().filter(|live| live.name == unit.name) {
                live.terminating = true;
            }
        } else {
            state.units.retain(|live| live.name != unit.name);
        }
        let id = unit.process_group_id.clone().unwrap_or_default();
        state.log.push(format!("delete {}", id));
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////
// Admin /////////////////////////////////////////////////////////////////////

/// An in-memory admin client, tracking exclusions and a single backup.
#[derive(Default)]
pub struct FakeAdmin {
    state: Mutex<FakeAdminState>,
}

#[derive(Default)]
struct FakeAdminState {
    excluded: BTreeSet<String>,
    /// Process groups which report their exclusion as still in progress.
    draining: BTreeSet<String>,
    backup: LiveBackupStatus,
    log: Vec<String>,
}

impl FakeAdmin {
    /// Snapshot the side effect log.
    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    /// Snapshot the currently excluded process groups.
    pub fn excluded(&self) -> BTreeSet<String> {
        self.lock().excluded.clone()
    }

    /// Keep reporting the exclusion of the given process group as in progress, or stop doing so.
    pub fn set_draining(&self, process_group_id: &str, draining: bool) {
        let mut state = self.lock();
        if draining {
            state.draining.insert(process_group_id.into());
        } else {
            state.draining.remove(process_group_id);
        }
    }

    /// Snapshot the live backup.
    pub fn backup(&self) -> LiveBackupStatus {
        self.lock().backup.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeAdminState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn join_ids(ids: &[ProcessGroupId]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

#[async_trait::async_trait]
impl AdminClient for FakeAdmin {
    async fn exclude(&self, ids: &[ProcessGroupId]) -> Result<()> {
        let mut state = self.lock();
        state.excluded.extend(ids.iter().map(ToString::to_string));
        state.log.push(format!("exclude {}", join_ids(ids)));
        Ok(())
    }

    async fn include(&self, ids: &[ProcessGroupId]) -> Result<()> {
        let mut state = self.lock();
        for id in ids {
            state.excluded.remove(&id.to_string());
        }
        state.log.push(format!("include {}", join_ids(ids)));
        Ok(())
    }

    async fn exclusions_in_progress(&self, ids: &[ProcessGroupId]) -> Result<Vec<ProcessGroupId>> {
        let state = self.lock();
        Ok(ids
            .iter()
            .filter(|id| !state.excluded.contains(&id.to_string()) || state.draining.contains(&id.to_string()))
            .cloned()
            .collect())
    }

    async fn start_backup(&self, url: &str, snapshot_period_seconds: u32) -> Result<()> {
        let mut state = self.lock();
        state.backup.destination_url = url.into();
        state.backup.snapshot_interval_seconds = snapshot_period_seconds;
        state.backup.status.running = true;
        state.log.push(format!("start_backup {} {}", url, snapshot_period_seconds));
        Ok(())
    }

    async fn stop_backup(&self) -> Result<()> {
        let mut state = self.lock();
        state.backup.status.running = false;
        state.log.push("stop_backup".into());
        Ok(())
    }

    async fn pause_backups(&self) -> Result<()> {
        let mut state = self.lock();
        state.backup.backup_agents_paused = true;
        state.log.push("pause_backups".into());
        Ok(())
    }

    async fn resume_backups(&self) -> Result<()> {
        let mut state = self.lock();
        state.backup.backup_agents_paused = false;
        state.log.push("resume_backups".into());
        Ok(())
    }

    async fn modify_backup(&self, snapshot_period_seconds: u32) -> Result<()> {
        let mut state = self.lock();
        state.backup.snapshot_interval_seconds = snapshot_period_seconds;
        state.log.push(format!("modify_backup {}", snapshot_period_seconds));
        Ok(())
    }

    async fn get_backup_status(&self) -> Result<LiveBackupStatus> {
        Ok(self.lock().backup.clone())
    }
}

//////////////////////////////////////////////////////////////////////////////
// Events ////////////////////////////////////////////////////////////////////

/// A recorder which keeps all events in memory.
#[derive(Default)]
pub struct FakeRecorder {
    events: Mutex<Vec<(EventType, String, String)>>,
}

impl FakeRecorder {
    /// The reasons of all recorded events of the given type, in order.
    pub fn reasons(&self, event_type: EventType) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|(kind, _, _)| *kind == event_type)
            .map(|(_, reason, _)| reason.clone())
            .collect()
    }

    /// The messages of all recorded events with the given reason, in order.
    pub fn messages(&self, reason: &str) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|(_, event_reason, _)| event_reason == reason)
            .map(|(_, _, message)| message.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl EventRecorder for FakeRecorder {
    async fn record(&self, _cluster: &DatabaseCluster, event_type: EventType, reason: &str, message: &str) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((event_type, reason.into(), message.into()));
    }
}
