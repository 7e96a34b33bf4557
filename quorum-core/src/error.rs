//! Quorum error abstractions.

use thiserror::Error;

/// Reconciliation error variants.
///
/// Collaborators and steps return `anyhow::Error`; these variants are carried inside and
/// recovered by downcasting where the controller needs to tell them apart.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A process group ID could not be parsed.
    #[error("could not parse process group ID {0}")]
    Parse(String),
    /// A call to Kubernetes or to a database admin tool failed.
    #[error("{message}{}", render_output(.output))]
    Collaborator {
        /// What was being attempted.
        message: String,
        /// Output captured from the collaborator, if any.
        output: String,
    },
    /// The roster references a process group with no backing workload unit.
    #[error("process group {0} has no backing workload unit")]
    Consistency(String),
    /// The proposed action would drop the available processes of a class below the required margin.
    #[error(
        "refusing to make {requested} {process_class} process group(s) unavailable: {available} available, {required} required"
    )]
    SafetyViolation {
        process_class: String,
        requested: usize,
        available: usize,
        required: usize,
    },
    /// The cluster spec is invalid.
    #[error("invalid cluster spec: {0}")]
    InvalidSpec(String),
}

impl ReconcileError {
    /// Build a collaborator error with no captured output.
    pub fn collaborator(message: impl Into<String>) -> Self {
        Self::Collaborator {
            message: message.into(),
            output: String::new(),
        }
    }

    /// Build a collaborator error carrying the output captured from an external tool.
    pub fn collaborator_with_output(message: impl Into<String>, output: impl Into<String>) -> Self {
        Self::Collaborator {
            message: message.into(),
            output: output.into(),
        }
    }

    /// The event reason under which this error is recorded on the cluster.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Parse(_) => "InvalidProcessGroupId",
            Self::Collaborator { .. } => "CollaboratorError",
            Self::Consistency(_) => "MissingWorkloadUnit",
            Self::SafetyViolation { .. } => "SafetyViolation",
            Self::InvalidSpec(_) => "InvalidSpec",
        }
    }
}

fn render_output(output: &str) -> String {
    let output = output.trim();
    if output.is_empty() {
        String::new()
    } else {
        format!(": {}", output)
    }
}
