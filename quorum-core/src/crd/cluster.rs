//! DatabaseCluster CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See examples/crd.rs.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;
use crate::process_group::{ProcessClass, ProcessGroupId};

pub type DatabaseCluster = DatabaseClusterCRD; // Mostly to resolve a Rust Analyzer issue.

/// The default image used for the main database container.
pub const DEFAULT_MAIN_IMAGE: &str = "foundationdb/foundationdb";
/// The default image used for the sidecar container.
pub const DEFAULT_SIDECAR_IMAGE: &str = "foundationdb/foundationdb-kubernetes-sidecar";

/// CRD spec for the DatabaseCluster resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "DatabaseClusterCRD",
    status = "DatabaseClusterStatus",
    group = "quorum.rs",
    version = "v1beta1",
    kind = "DatabaseCluster",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "dbcluster",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Running Version","type":"string","jsonPath":".status.runningVersion"}"#,
    printcolumn = r#"{"name":"Fault Tolerance","type":"number","jsonPath":".spec.faultTolerance"}"#,
    printcolumn = r#"{"name":"Reconciled","type":"number","jsonPath":".status.generations.reconciled"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseClusterSpec {
    /// The version of the database to run.
    ///
    /// This is used as the tag of the main container image. Changing it triggers a rolling
    /// replacement of the cluster's Pods.
    pub version: String,
    /// The desired number of process groups for each process class.
    ///
    /// A process class which is present in the cluster but absent here is scaled down to zero.
    #[serde(default)]
    pub process_counts: BTreeMap<String, u32>,
    /// The number of process groups of any one class which may be unavailable at the same time.
    #[serde(default = "DatabaseClusterSpec::fault_tolerance_default")]
    pub fault_tolerance: u32,
    /// An optional location prefix for the IDs of new process groups, e.g. `dc1`.
    #[serde(default)]
    pub process_group_id_prefix: Option<String>,

    /// Settings for the main database container.
    #[serde(default)]
    pub main_container: ContainerSpec,
    /// Settings for the sidecar container.
    #[serde(default)]
    pub sidecar_container: ContainerSpec,
    /// The build number of the sidecar image for the current version.
    #[serde(default)]
    pub sidecar_build: Option<u32>,
    /// Per process class settings.
    #[serde(default)]
    pub process_settings: BTreeMap<String, ProcessSettings>,

    /// Options controlling how changes are rolled out.
    #[serde(default)]
    pub automation_options: AutomationOptions,
    /// Process groups which should be removed from the cluster.
    ///
    /// Removed process groups are replaced with new ones so that the process counts are kept.
    #[serde(default)]
    pub process_groups_to_remove: Vec<String>,

    /// The continuous backup to run for this cluster.
    #[serde(default)]
    pub backup: Option<BackupSpec>,
}

impl DatabaseClusterSpec {
    /// The default fault tolerance, a single unavailable process group per class.
    pub fn fault_tolerance_default() -> u32 {
        1
    }
}

/// Image settings for one of the containers of a process group's Pod.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    /// The image name, without a tag.
    #[serde(default)]
    pub image_name: Option<String>,
    /// Allow the image name to carry its own tag.
    #[serde(default)]
    pub allow_tag_override: bool,
}

/// Settings which apply to a single process class.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSettings {
    /// Override the main container image for this class.
    #[serde(default)]
    pub main_image: Option<String>,
    /// Override the sidecar container image for this class.
    #[serde(default)]
    pub sidecar_image: Option<String>,
    /// Allow the overrides above to carry their own tag.
    #[serde(default)]
    pub allow_tag_override: bool,
}

/// Options controlling how changes are rolled out.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutomationOptions {
    /// How many Pods may be deleted at once when replacing them. Defaults to `Zone`.
    #[serde(default)]
    pub deletion_mode: Option<DeletionMode>,
}

/// The granularity at which Pods are deleted during a rolling change.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum DeletionMode {
    /// Delete the Pods of one fault domain, and wait for them to be replaced before the next.
    Zone,
    /// Delete one Pod at a time.
    ProcessGroup,
    /// Delete all Pods needing replacement at once.
    All,
}

impl Default for DeletionMode {
    fn default() -> Self {
        Self::Zone
    }
}

impl std::fmt::Display for DeletionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Zone => "Zone",
                Self::ProcessGroup => "ProcessGroup",
                Self::All => "All",
            }
        )
    }
}

/// The continuous backup to run for a cluster.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// The destination URL of the backup.
    pub url: String,
    /// The target duration of a complete snapshot, in seconds.
    #[serde(default = "BackupSpec::snapshot_period_seconds_default")]
    pub snapshot_period_seconds: u32,
    /// The desired state of the backup.
    #[serde(default)]
    pub state: BackupState,
}

impl BackupSpec {
    /// The default snapshot period, which is 10 days.
    pub fn snapshot_period_seconds_default() -> u32 {
        864_000 // 10 days.
    }
}

/// The desired state of a backup.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum BackupState {
    Running,
    Paused,
    Stopped,
}

impl Default for BackupState {
    fn default() -> Self {
        Self::Running
    }
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseClusterStatus {
    /// The roster of process groups belonging to this cluster.
    #[serde(default)]
    pub process_groups: Vec<ProcessGroupStatus>,
    /// Process groups which are being removed, mapped to the reason for their removal.
    #[serde(default)]
    pub pending_removals: BTreeMap<String, String>,
    /// Generation counters for the different reconciliation concerns.
    #[serde(default)]
    pub generations: GenerationStatus,
    /// The version which all Pods of the cluster are running.
    #[serde(default)]
    pub running_version: Option<String>,
    /// The connection string used by admin tooling to reach the database.
    #[serde(default)]
    pub connection_string: Option<String>,
}

/// The observed state of a single process group.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessGroupStatus {
    /// The ID of this process group.
    pub process_group_id: String,
    /// The process class of this process group, without any location prefix.
    pub process_class: String,
    /// Whether this process group has been excluded from the database.
    #[serde(default)]
    pub excluded: bool,
    /// Whether this process group is marked for removal.
    #[serde(default)]
    pub remove: bool,
}

impl ProcessGroupStatus {
    pub fn new(id: &ProcessGroupId, class: &ProcessClass) -> Self {
        Self {
            process_group_id: id.to_string(),
            process_class: class.to_string(),
            excluded: false,
            remove: false,
        }
    }

    /// Parse this entry's ID.
    pub fn id(&self) -> Result<ProcessGroupId, ReconcileError> {
        ProcessGroupId::parse(&self.process_group_id)
    }

    pub fn class(&self) -> ProcessClass {
        ProcessClass::new(self.process_class.clone())
    }
}

/// The generation at which each reconciliation concern was last seen outstanding.
///
/// A counter is cleared at the start of each pass and set by the step responsible for it when
/// that step cannot complete its work.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStatus {
    /// The generation of the spec which was last fully reconciled.
    #[serde(default)]
    pub reconciled: Option<i64>,
    #[serde(default)]
    pub missing_units: Option<i64>,
    #[serde(default)]
    pub needs_sidecar_upgrade: Option<i64>,
    #[serde(default)]
    pub needs_version_upgrade: Option<i64>,
    #[serde(default)]
    pub needs_exclusion: Option<i64>,
    #[serde(default)]
    pub needs_removal: Option<i64>,
    #[serde(default)]
    pub needs_backup_change: Option<i64>,
}

impl GenerationStatus {
    /// Clear all outstanding concerns, keeping the last reconciled generation.
    pub fn clear_outstanding(&mut self) {
        *self = Self {
            reconciled: self.reconciled,
            ..Default::default()
        };
    }
}

impl DatabaseCluster {
    /// The generation of this object's spec.
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or_default()
    }

    /// The status of this cluster, created as needed.
    pub fn status_mut(&mut self) -> &mut DatabaseClusterStatus {
        self.status.get_or_insert_with(Default::default)
    }

    /// The roster of this cluster.
    pub fn process_groups(&self) -> &[ProcessGroupStatus] {
        self.status.as_ref().map(|status| status.process_groups.as_slice()).unwrap_or_default()
    }

    /// The configured deletion mode, defaulting to `Zone`.
    pub fn deletion_mode(&self) -> DeletionMode {
        self.spec.automation_options.deletion_mode.unwrap_or_default()
    }

    /// The desired count of process groups for the given class.
    pub fn desired_count(&self, class: &ProcessClass) -> u32 {
        self.spec.process_counts.get(class.as_str()).copied().unwrap_or(0)
    }

    /// The full sidecar version, `<version>-<build>`.
    pub fn sidecar_version(&self) -> String {
        format!("{}-{}", self.spec.version, self.spec.sidecar_build.unwrap_or(1))
    }

    /// The main container image for process groups of the given class.
    pub fn main_image(&self, class: &ProcessClass) -> Result<String, ReconcileError> {
        let settings = self.spec.process_settings.get(class.as_str());
        let container = &self.spec.main_container;
        resolve_image(
            container.image_name.as_deref(),
            settings.and_then(|settings| settings.main_image.as_deref()),
            DEFAULT_MAIN_IMAGE,
            &self.spec.version,
            container.allow_tag_override || settings.map(|settings| settings.allow_tag_override).unwrap_or(false),
        )
    }

    /// The sidecar container image for process groups of the given class.
    pub fn sidecar_image(&self, class: &ProcessClass) -> Result<String, ReconcileError> {
        let settings = self.spec.process_settings.get(class.as_str());
        let container = &self.spec.sidecar_container;
        resolve_image(
            container.image_name.as_deref(),
            settings.and_then(|settings| settings.sidecar_image.as_deref()),
            DEFAULT_SIDECAR_IMAGE,
            &self.sidecar_version(),
            container.allow_tag_override || settings.map(|settings| settings.allow_tag_override).unwrap_or(false),
        )
    }
}

/// Resolve the image to use for a container.
///
/// A per-class override wins over the cluster-wide image name, which wins over the default. The
/// version is appended as the tag unless the chosen image already carries a tag, which is only
/// permitted when tag overrides are allowed.
pub fn resolve_image(image_name: Option<&str>, class_override: Option<&str>, default: &str, version: &str, allow_tag_override: bool) -> Result<String, ReconcileError> {
    let image = class_override
        .filter(|image| !image.is_empty())
        .or_else(|| image_name.filter(|image| !image.is_empty()))
        .unwrap_or(default);

    // The tag is whatever follows the last `:` of the final path segment, which keeps registry
    // ports (`registry:5000/db`) out of the picture.
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    match last_segment.split_once(':') {
        Some(_) if allow_tag_override => Ok(image.to_string()),
        Some((_, tag)) => Err(ReconcileError::InvalidSpec(format!(
            "image should not contain a tag but contains the tag \"{}\", please remove the tag",
            tag
        ))),
        None => Ok(format!("{}:{}", image, version)),
    }
}
