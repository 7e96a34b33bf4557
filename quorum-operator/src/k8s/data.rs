use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::Event;
use kube::Resource;

use crate::k8s::reconcile::METRIC_WATCHER_ERRORS;
use crate::k8s::{Controller, EventResult};
use quorum_core::crd::DatabaseCluster;
use quorum_core::LABEL_CLUSTER;

/// The delay applied after a watcher error, before the watcher is polled again.
const WATCHER_ERROR_DELAY: Duration = Duration::from_secs(10);

//////////////////////////////////////////////////////////////////////////////
// Cluster Events ////////////////////////////////////////////////////////////
impl Controller {
    /// Handle `DatabaseCluster` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_cluster_event(&mut self, res: EventResult<DatabaseCluster>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from DatabaseCluster k8s watcher");
                metrics::increment_counter!(METRIC_WATCHER_ERRORS, "watcher" => "cluster");
                let _ = tokio::time::sleep(WATCHER_ERROR_DELAY).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.cluster_applied(obj),
            Event::Deleted(obj) => self.cluster_deleted(obj),
            Event::Restarted(objs) => self.cluster_restarted(objs),
        }
    }

    /// Cache the given cluster, queueing a pass when it is new or its spec has changed.
    ///
    /// Status-only updates, most of which are written by this operator, are cached without
    /// triggering a pass.
    #[tracing::instrument(level = "debug", skip(self, cluster))]
    fn cluster_applied(&mut self, cluster: DatabaseCluster) {
        let name_str = match cluster.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let (name, changed) = match self.clusters.get_key_value(name_str) {
            Some((key, old)) => {
                if old == &cluster {
                    return;
                }
                (Arc::clone(key), old.meta().generation != cluster.meta().generation)
            }
            None => (Arc::new(name_str.clone()), true),
        };
        self.clusters.insert(name.clone(), cluster);
        if changed {
            self.enqueue(name);
        }
    }

    #[tracing::instrument(level = "debug", skip(self, cluster))]
    fn cluster_deleted(&mut self, cluster: DatabaseCluster) {
        let name_str = match cluster.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        self.forget_cluster(name_str);
    }

    #[tracing::instrument(level = "debug", skip(self, clusters))]
    fn cluster_restarted(&mut self, clusters: Vec<DatabaseCluster>) {
        let live: HashSet<String> = clusters.iter().filter_map(|cluster| cluster.meta().name.clone()).collect();
        let gone: Vec<String> = self.clusters.keys().filter(|name| !live.contains(name.as_str())).map(|name| name.to_string()).collect();
        for name in gone {
            self.forget_cluster(&name);
        }
        for cluster in clusters {
            self.cluster_applied(cluster);
        }
    }

    /// Drop all state of the named cluster, cancelling any in-flight pass.
    fn forget_cluster(&mut self, name: &String) {
        let name = match self.clusters.remove_entry(name) {
            Some((name, _cluster)) => name,
            None => return,
        };
        self.queue.forget(&name);
        self.backoffs.remove(&name);
        if let Some(cancel) = self.cancellations.remove(&name) {
            let _ = cancel.send(());
        }
        tracing::info!(cluster = %name, "cluster deleted");
    }
}

//////////////////////////////////////////////////////////////////////////////
// Pod Events ////////////////////////////////////////////////////////////////
impl Controller {
    /// Handle `Pod` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_pod_event(&mut self, res: EventResult<Pod>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from Pod k8s watcher");
                metrics::increment_counter!(METRIC_WATCHER_ERRORS, "watcher" => "pod");
                let _ = tokio::time::sleep(WATCHER_ERROR_DELAY).await;
                return;
            }
        };
        match event {
            Event::Applied(pod) | Event::Deleted(pod) => self.pod_changed(&pod),
            Event::Restarted(pods) => pods.iter().for_each(|pod| self.pod_changed(pod)),
        }
    }

    /// Queue a pass for the cluster owning the given pod.
    fn pod_changed(&mut self, pod: &Pod) {
        let name = match pod.meta().labels.as_ref().and_then(|labels| labels.get(LABEL_CLUSTER)) {
            Some(name) => name,
            None => return,
        };
        if let Some((key, _)) = self.clusters.get_key_value(name) {
            let key = Arc::clone(key);
            self.enqueue(key);
        }
    }
}
