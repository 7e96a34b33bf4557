//! Kubernetes events recorded against clusters.

use std::time::Duration;

use k8s_openapi::api::core::v1::{Event, EventSource};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta, Time};
use kube::api::{Api, PostParams};
use kube::client::Client;
use kube::Resource;
use tokio::time::timeout;

use crate::k8s::APP_NAME;
use crate::recorder::{EventRecorder, EventType};
use quorum_core::crd::{DatabaseCluster, RequiredMetadata};

/// Records `core/v1` events with the cluster as involved object.
pub struct KubeEventRecorder {
    client: Client,
    /// The name of this pod, reported as the instance recording events.
    instance: String,
    api_timeout: Duration,
}

impl KubeEventRecorder {
    pub fn new(client: Client, instance: String, api_timeout: Duration) -> Self {
        Self { client, instance, api_timeout }
    }
}

/// Build the event to record against the given cluster.
pub fn build_event(cluster: &DatabaseCluster, event_type: EventType, reason: &str, message: &str, instance: &str) -> Event {
    let now = chrono::Utc::now();
    Event {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", cluster.name())),
            namespace: Some(cluster.namespace().into()),
            ..Default::default()
        },
        involved_object: cluster.object_ref(&()),
        type_: Some(event_type.as_str().into()),
        reason: Some(reason.into()),
        message: Some(message.into()),
        count: Some(1),
        first_timestamp: Some(Time(now)),
        last_timestamp: Some(Time(now)),
        event_time: Some(MicroTime(now)),
        action: Some("Reconcile".into()),
        source: Some(EventSource {
            component: Some(APP_NAME.into()),
            host: None,
        }),
        reporting_component: Some(APP_NAME.into()),
        reporting_instance: Some(instance.into()),
        ..Default::default()
    }
}

#[async_trait::async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, cluster: &DatabaseCluster, event_type: EventType, reason: &str, message: &str) {
        let event = build_event(cluster, event_type, reason, message, &self.instance);
        let api: Api<Event> = Api::namespaced(self.client.clone(), cluster.namespace());
        match timeout(self.api_timeout, api.create(&PostParams::default(), &event)).await {
            Ok(Ok(_)) => tracing::debug!(cluster = %cluster.name(), %reason, "event recorded"),
            Ok(Err(err)) => tracing::warn!(error = ?err, cluster = %cluster.name(), %reason, "error recording event"),
            Err(_) => tracing::warn!(cluster = %cluster.name(), %reason, "timeout recording event"),
        }
    }
}
