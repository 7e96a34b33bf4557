//! Workload units.
//!
//! A workload unit is the Pod backing a single process group. Units are looked up by label on
//! every pass and never held across passes; the roster in the cluster status is the source of
//! truth for which process groups exist.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

use quorum_core::crd::{DatabaseCluster, DeletionMode, ProcessGroupStatus};
use quorum_core::ProcessClass;

/// The name of the main database container of a unit.
pub const CONTAINER_MAIN: &str = "database";
/// The name of the sidecar container of a unit.
pub const CONTAINER_SIDECAR: &str = "sidecar";

/// Operations on the workload units of a cluster.
#[async_trait::async_trait]
pub trait UnitManager: Send + Sync {
    /// List all units of the given cluster matching the given selector.
    async fn list_units(&self, cluster: &DatabaseCluster, selector: &UnitSelector) -> Result<Vec<WorkloadUnit>>;

    /// Create the unit backing the given process group.
    async fn create_unit(&self, cluster: &DatabaseCluster, group: &ProcessGroupStatus) -> Result<()>;

    /// Replace the image of the container at the given index of the given unit.
    ///
    /// This is not conditional, callers check whether the image already matches.
    async fn update_image(&self, unit: &WorkloadUnit, container_index: usize, image: &str) -> Result<()>;

    /// Request deletion of the given unit.
    ///
    /// A unit which is already gone is not an error. Deleted units disappear from later listings
    /// only eventually.
    async fn delete_unit(&self, unit: &WorkloadUnit) -> Result<()>;

    /// The granularity at which units of the given cluster may be deleted.
    fn deletion_mode(&self, cluster: &DatabaseCluster) -> DeletionMode {
        cluster.deletion_mode()
    }
}

/// A snapshot of the Pod backing a process group.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkloadUnit {
    pub name: String,
    pub namespace: String,
    /// The process group ID label of the unit, if any.
    pub process_group_id: Option<String>,
    /// The process class label of the unit, if any.
    pub process_class: Option<String>,
    pub containers: Vec<UnitContainer>,
    /// All labels of the unit.
    pub labels: BTreeMap<String, String>,
    /// Whether all containers of the unit are ready.
    pub ready: bool,
    /// Whether deletion of the unit has been requested.
    pub terminating: bool,
    /// The fault domain of the unit.
    pub fault_domain: String,
}

/// A container of a workload unit.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UnitContainer {
    pub name: String,
    pub image: String,
}

impl WorkloadUnit {
    /// The index of the container with the given name.
    pub fn container_index(&self, name: &str) -> Option<usize> {
        self.containers.iter().position(|container| container.name == name)
    }

    /// The image of the container with the given name.
    pub fn image(&self, name: &str) -> Option<&str> {
        self.containers.iter().find(|container| container.name == name).map(|container| container.image.as_str())
    }

    /// Whether this unit is serving, i.e. ready and not being deleted.
    pub fn is_available(&self) -> bool {
        self.ready && !self.terminating
    }
}

/// A filter over the units of a single cluster.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UnitSelector {
    /// Only match units of this process class.
    pub process_class: Option<ProcessClass>,
    /// Only match units of these process groups.
    pub process_group_ids: Option<BTreeSet<String>>,
}

impl UnitSelector {
    /// A selector matching all units of a cluster.
    pub fn all() -> Self {
        Self::default()
    }

    /// A selector matching the units of the given process groups.
    pub fn process_groups<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            process_class: None,
            process_group_ids: Some(ids.into_iter().map(Into::into).collect()),
        }
    }

    /// Check if the given unit matches this selector.
    pub fn matches(&self, unit: &WorkloadUnit) -> bool {
        if let Some(class) = &self.process_class {
            if unit.process_class.as_deref() != Some(class.as_str()) {
                return false;
            }
        }
        if let Some(ids) = &self.process_group_ids {
            match &unit.process_group_id {
                Some(id) if ids.contains(id) => (),
                _ => return false,
            }
        }
        true
    }
}

/// Index the given units by their process group ID.
///
/// Units without a process group ID are skipped. When more than one unit claims the same ID,
/// the first one wins.
pub fn units_by_process_group(units: &[WorkloadUnit]) -> BTreeMap<&str, &WorkloadUnit> {
    let mut index = BTreeMap::new();
    for unit in units {
        if let Some(id) = unit.process_group_id.as_deref() {
            index.entry(id).or_insert(unit);
        }
    }
    index
}
