//! Operational events recorded against clusters.

use quorum_core::crd::DatabaseCluster;

/// The type of a recorded event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        }
    }
}

/// A sink for human-readable operational events.
///
/// Recording is best-effort. Implementations log their own failures and never fail the caller.
#[async_trait::async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, cluster: &DatabaseCluster, event_type: EventType, reason: &str, message: &str);
}
