//! The fault tolerance budget.
//!
//! For each process class, at most `faultTolerance` process groups may be unavailable at once.
//! A group is available when it is not excluded and its unit is ready and not being deleted.
//! Steps which make groups unavailable, by excluding them or by deleting their units, must be
//! admitted by the budget first.
//!
//! Groups which are both excluded and marked for removal have already shed their data and roles,
//! so they no longer count towards the size of their class.

use std::collections::BTreeMap;

use crate::units::{units_by_process_group, WorkloadUnit};
use quorum_core::crd::{DatabaseCluster, ProcessGroupStatus};
use quorum_core::ReconcileError;

/// The availability of a single process class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClassAvailability {
    /// The number of process groups of the class in the roster, less those already on their way out.
    pub total: usize,
    /// The number of those groups which are currently available.
    pub available: usize,
    /// The number of groups of the class which may be unavailable at once.
    pub fault_tolerance: usize,
}

impl ClassAvailability {
    /// The number of groups which must stay available.
    pub fn required(&self) -> usize {
        self.total.saturating_sub(self.fault_tolerance)
    }

    /// The number of additional groups which may be made unavailable.
    pub fn budget(&self) -> usize {
        self.available.saturating_sub(self.required())
    }

    pub fn is_fully_available(&self) -> bool {
        self.available >= self.total
    }
}

/// The fault tolerance budget of a cluster, per process class.
#[derive(Clone, Debug, Default)]
pub struct SafetyBudget {
    classes: BTreeMap<String, ClassAvailability>,
    /// The availability as first observed, before any admissions.
    observed: BTreeMap<String, ClassAvailability>,
}

impl SafetyBudget {
    /// Compute the budget of the given cluster from its roster and its live units.
    pub fn compute(cluster: &DatabaseCluster, units: &[WorkloadUnit]) -> Self {
        let index = units_by_process_group(units);
        let fault_tolerance = cluster.spec.fault_tolerance as usize;
        let mut classes: BTreeMap<String, ClassAvailability> = BTreeMap::new();
        for group in cluster.process_groups().iter().filter(|group| !(group.remove && group.excluded)) {
            let class = classes.entry(group.process_class.clone()).or_insert(ClassAvailability {
                fault_tolerance,
                ..Default::default()
            });
            class.total += 1;
            if is_available(group, index.get(group.process_group_id.as_str()).copied()) {
                class.available += 1;
            }
        }
        Self {
            observed: classes.clone(),
            classes,
        }
    }

    /// The current availability of the given class.
    pub fn class(&self, class: &str) -> ClassAvailability {
        self.classes.get(class).copied().unwrap_or_default()
    }

    /// Ask to make a group of the given class unavailable.
    ///
    /// Groups which are already unavailable are always admitted. Otherwise the group is admitted
    /// only while the class has budget left, which the admission consumes.
    pub fn admit(&mut self, class: &str, currently_available: bool) -> bool {
        if !currently_available {
            return true;
        }
        match self.classes.get_mut(class) {
            Some(availability) if availability.budget() > 0 => {
                availability.available -= 1;
                true
            }
            _ => false,
        }
    }

    /// The error or wait reason for a class which refused all of its candidates.
    ///
    /// A class which is fully available yet has no budget can never make progress, which is a
    /// safety violation. Otherwise progress resumes once unavailable groups recover.
    pub fn refusal(&self, class: &str, requested: usize) -> Result<String, ReconcileError> {
        let observed = self.observed.get(class).copied().unwrap_or_default();
        if observed.is_fully_available() {
            return Err(ReconcileError::SafetyViolation {
                process_class: class.to_string(),
                requested,
                available: observed.available,
                required: observed.required(),
            });
        }
        Ok(format!(
            "waiting for {} process group(s) to become available before taking down {} more {} process group(s)",
            observed.total - observed.available,
            requested,
            class
        ))
    }
}

/// Check if the given process group currently counts as available.
pub fn is_available(group: &ProcessGroupStatus, unit: Option<&WorkloadUnit>) -> bool {
    !group.excluded && unit.map(WorkloadUnit::is_available).unwrap_or(false)
}
