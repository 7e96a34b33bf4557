//! Quorum CRDs.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/#additional-printer-columns

mod cluster;

use kube::Resource;

pub use cluster::{
    resolve_image, AutomationOptions, BackupSpec, BackupState, ContainerSpec, DatabaseCluster, DatabaseClusterSpec, DatabaseClusterStatus,
    DeletionMode, GenerationStatus, ProcessGroupStatus, ProcessSettings, DEFAULT_MAIN_IMAGE, DEFAULT_SIDECAR_IMAGE,
};

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;
}

impl RequiredMetadata for DatabaseCluster {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}
