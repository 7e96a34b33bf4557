pub mod admin;
pub mod crd;
pub mod error;
pub mod process_group;
#[cfg(test)]
mod process_group_test;

pub use error::ReconcileError;
pub use process_group::{process_group_id_from_process_id, ProcessClass, ProcessGroupId};

/// Comma-separated list of canonical label selectors which match the
/// Quorum Operator's labelling scheme.
pub const QUORUM_OPERATOR_LABEL_SELECTORS: &str = "app=quorum,quorum.rs/controlled-by=quorum-operator";

/// The canonical `app` label value of all objects managed by the operator.
pub const LABEL_APP_VALUE: &str = "quorum";
/// The canonical `quorum.rs/controlled-by` label value.
pub const LABEL_CONTROLLED_BY_VALUE: &str = "quorum-operator";

pub const LABEL_K8S_APP: &str = "app";
pub const LABEL_CONTROLLED_BY: &str = "quorum.rs/controlled-by";
/// The label holding the name of the cluster a Pod belongs to.
pub const LABEL_CLUSTER: &str = "quorum.rs/cluster";
/// The label holding the process group ID of a Pod.
pub const LABEL_PROCESS_GROUP_ID: &str = "quorum.rs/process-group-id";
/// The label holding the process class of a Pod.
pub const LABEL_PROCESS_CLASS: &str = "quorum.rs/process-class";
/// The label holding the fault domain of a Pod. Falls back to the Pod's node when absent.
pub const LABEL_FAULT_DOMAIN: &str = "quorum.rs/fault-domain";
