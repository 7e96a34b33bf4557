//! Kubernetes controller.
//!
//! This controller observes `DatabaseCluster` objects and the Pods backing them, caches the
//! clusters of its namespace, and runs reconciliation passes for every cluster which has changed.
//!
//! Only the leader runs passes. Followers keep their cache warm so that a new leader can begin
//! reconciling as soon as it acquires the lease. Every mutation made by a pass is fenced on the
//! lease, so a deposed leader can not make changes concurrently with its successor.

mod coordination;
#[cfg(test)]
mod coordination_test;
mod data;
mod events;
mod queue;
mod reconcile;
#[cfg(test)]
mod reconcile_test;
pub(crate) mod units;
#[cfg(test)]
mod units_test;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::prelude::*;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::watcher::{watcher, Error as WatcherError, Event};
use tokio::sync::{broadcast, mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::error::Elapsed;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream, WatchStream};

use crate::config::Config;
use crate::k8s::coordination::{LeaderElectionConfig, LeaderElector, LeaderState, LeaseFence};
use crate::k8s::events::KubeEventRecorder;
use crate::k8s::queue::WorkQueue;
use crate::k8s::reconcile::{PassDone, PassResult, PassTask};
use crate::k8s::units::KubeUnitManager;
use crate::pipeline::{PassContext, Pipeline};
use quorum_core::admin::CliAdminClient;
use quorum_core::crd::DatabaseCluster;
use quorum_core::ReconcileError;
use quorum_core::{LABEL_APP_VALUE, LABEL_CONTROLLED_BY, LABEL_CONTROLLED_BY_VALUE, LABEL_K8S_APP, QUORUM_OPERATOR_LABEL_SELECTORS};

/// The app name used by the operator.
pub(crate) const APP_NAME: &str = "quorum-operator";
/// The duration which leader elector clients should wait between action retries.
///
/// Core K8s clients default this value to 2 seconds.
const LEASE_RETRY_SECONDS: i64 = 2;
/// The time given to in-flight passes to stop during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

type EventResult<T> = std::result::Result<Event<T>, WatcherError>;

/// Kubernetes controller for reconciling `DatabaseCluster` objects.
pub struct Controller {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
    /// The configuration used to drive the leader election system, moved out after being spawned.
    leader_election_config: Option<LeaderElectionConfig>,
    /// The currently known leader state.
    leader_state: LeaderState,

    /// The pipeline run by each pass.
    pipeline: Arc<Pipeline>,
    /// The unit manager shared by all passes.
    units: Arc<KubeUnitManager>,
    /// The event recorder shared by all passes.
    recorder: Arc<KubeEventRecorder>,
    /// The fence guarding mutations made by passes.
    fence: LeaseFence,

    /// All known cluster objects in the watched namespace.
    clusters: HashMap<Arc<String>, DatabaseCluster>,
    /// Clusters waiting for a pass.
    queue: WorkQueue<Arc<String>>,
    /// Bounds the number of concurrent passes.
    workers: Arc<Semaphore>,
    /// The backoff state of clusters whose last pass failed.
    backoffs: HashMap<Arc<String>, ExponentialBackoff>,
    /// Cancellation handles of in-flight passes.
    cancellations: HashMap<Arc<String>, oneshot::Sender<()>>,

    /// A channel of delayed requeues.
    requeue_tx: mpsc::Sender<Arc<String>>,
    /// A channel of delayed requeues.
    requeue_rx: ReceiverStream<Arc<String>>,
    /// A channel of finished passes.
    passes_tx: mpsc::Sender<PassDone>,
    /// A channel of finished passes.
    passes_rx: ReceiverStream<PassDone>,
}

impl Controller {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        let elect_conf = LeaderElectionConfig::new(
            config.namespace.clone(),
            APP_NAME,
            config.pod_name.clone(),
            chrono::Duration::seconds(config.lease_duration_seconds as i64),
            chrono::Duration::seconds(config.lease_renew_seconds as i64),
            chrono::Duration::seconds(LEASE_RETRY_SECONDS),
            config.api_timeout(),
        )
        .context("invalid lease coordination config")?;
        let fence = elect_conf.fence(client.clone());
        let units = Arc::new(KubeUnitManager::new(client.clone(), fence.clone(), config.api_timeout()));
        let recorder = Arc::new(KubeEventRecorder::new(client.clone(), config.pod_name.clone(), config.api_timeout()));
        let (requeue_tx, requeue_rx) = mpsc::channel(1000);
        let (passes_tx, passes_rx) = mpsc::channel(1000);
        reconcile::register_metrics();
        let pipeline = Pipeline::standard();
        tracing::debug!(steps = ?pipeline.step_names(), "reconciliation pipeline built");
        Ok(Self {
            client,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            leader_election_config: Some(elect_conf),
            leader_state: LeaderState::Standby,
            pipeline: Arc::new(pipeline),
            units,
            recorder,
            fence,
            clusters: Default::default(),
            queue: Default::default(),
            workers: Arc::new(Semaphore::new(config.workers)),
            backoffs: Default::default(),
            cancellations: Default::default(),
            requeue_tx,
            requeue_rx: ReceiverStream::new(requeue_rx),
            passes_tx,
            passes_rx: ReceiverStream::new(passes_rx),
            config,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        // Spawn leader elector.
        let elect_config = match self.leader_election_config.take() {
            Some(elect_config) => elect_config,
            None => {
                let _ = self.shutdown_tx.send(());
                anyhow::bail!("error accessing leader election config, this should never happen");
            }
        };
        let (elector, state_rx) = LeaderElector::new(elect_config, self.client.clone(), self.shutdown_tx.subscribe());
        let (elector, mut state_rx) = (elector.spawn(), WatchStream::new(state_rx));

        // Build watcher streams.
        let clusters: Api<DatabaseCluster> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let clusters_watcher = watcher(clusters, ListParams::default());
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let pods_watcher = watcher(pods, list_params_cluster_selector_labels());
        tokio::pin!(clusters_watcher, pods_watcher);
        let mut resync = tokio::time::interval(self.config.resync());

        tracing::info!("k8s controller initialized");
        loop {
            tokio::select! {
                Some(k8s_event_res) = clusters_watcher.next() => self.handle_cluster_event(k8s_event_res).await,
                Some(k8s_event_res) = pods_watcher.next() => self.handle_pod_event(k8s_event_res).await,
                Some(new_leader_state) = state_rx.next() => self.handle_leader_state(new_leader_state),
                Some(name) = self.requeue_rx.next() => self.enqueue(name),
                Some(done) = self.passes_rx.next() => self.handle_pass_done(done),
                _ = resync.tick() => self.enqueue_all(),
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("k8s controller shutting down");
        for (_, cancel) in self.cancellations.drain() {
            let _ = cancel.send(());
        }
        let permits = self.config.workers as u32;
        if tokio::time::timeout(SHUTDOWN_GRACE, self.workers.acquire_many(permits)).await.is_err() {
            tracing::warn!("timeout waiting for in-flight reconciliation passes to stop");
        }
        if let Err(err) = elector.await {
            tracing::error!(error = ?err, "error shutting down leader elector");
        }

        tracing::debug!("k8s controller shutdown");
        Ok(())
    }

    /// Handle a change in leadership.
    ///
    /// A new leader reconciles every known cluster, as changes may have been missed since the
    /// previous leader's last pass. An instance losing leadership stops its in-flight passes.
    fn handle_leader_state(&mut self, state: LeaderState) {
        tracing::debug!(?state, "new leader state detected");
        self.leader_state = state;
        if self.leader_state == LeaderState::Leading {
            self.enqueue_all();
            return;
        }
        for (name, cancel) in self.cancellations.drain() {
            tracing::debug!(cluster = %name, "cancelling pass after losing leadership");
            let _ = cancel.send(());
        }
    }

    /// Queue a pass for the named cluster, if it is still known.
    fn enqueue(&mut self, name: Arc<String>) {
        if !self.clusters.contains_key(&name) {
            return;
        }
        if self.queue.add(name.clone()) {
            tracing::debug!(cluster = %name, queued = self.queue.len(), "cluster queued for reconciliation");
        } else if self.queue.is_in_flight(&name) {
            tracing::debug!(cluster = %name, "cluster changed during its pass, it will be queued again");
        }
        self.dispatch();
    }

    /// Queue a pass for every known cluster.
    fn enqueue_all(&mut self) {
        let names: Vec<_> = self.clusters.keys().cloned().collect();
        for name in names {
            self.queue.add(name);
        }
        self.dispatch();
    }

    /// Start passes for queued clusters while workers are free.
    fn dispatch(&mut self) {
        if self.leader_state != LeaderState::Leading {
            return;
        }
        while !self.queue.is_empty() {
            let permit = match self.workers.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let name = match self.queue.next() {
                Some(name) => name,
                None => return,
            };
            let cluster = match self.clusters.get(&name) {
                Some(cluster) => cluster.clone(),
                None => {
                    self.queue.done(&name);
                    continue;
                }
            };

            let (cancel_tx, cancel_rx) = oneshot::channel();
            self.cancellations.insert(name.clone(), cancel_tx);
            let ctx = PassContext {
                units: self.units.clone(),
                admin: Arc::new(CliAdminClient::for_cluster(&self.config.admin_config(), &cluster)),
                recorder: self.recorder.clone(),
            };
            tracing::debug!(cluster = %name, "starting reconciliation pass");
            PassTask {
                name,
                cluster,
                ctx,
                pipeline: self.pipeline.clone(),
                config: self.config.clone(),
                client: self.client.clone(),
                fence: self.fence.clone(),
                shutdown: self.shutdown_tx.subscribe(),
                cancel: cancel_rx,
                done_tx: self.passes_tx.clone(),
                permit,
            }
            .spawn();
        }
    }

    /// Handle the result of a finished pass, scheduling any retry.
    fn handle_pass_done(&mut self, done: PassDone) {
        let PassDone { name, result, updated } = done;
        self.queue.done(&name);
        self.cancellations.remove(&name);
        if let (Some(updated), Some(cached)) = (updated, self.clusters.get_mut(&name)) {
            *cached = updated;
        }

        match result {
            PassResult::Complete => {
                self.backoffs.remove(&name);
            }
            PassResult::Blocked(requeue_after) => {
                self.backoffs.remove(&name);
                self.spawn_requeue(name, requeue_after.max(self.config.requeue()));
            }
            PassResult::Failed => {
                let (requeue, max_backoff) = (self.config.requeue(), self.config.max_backoff());
                let delay = self
                    .backoffs
                    .entry(name.clone())
                    .or_insert_with(|| pass_backoff(requeue, max_backoff))
                    .next_backoff()
                    .unwrap_or(max_backoff);
                tracing::debug!(cluster = %name, ?delay, "retrying failed pass after backoff");
                self.spawn_requeue(name, delay);
            }
            PassResult::Cancelled => (),
        }
        self.dispatch();
    }

    /// Spawn a task which requeues the named cluster after the given delay.
    ///
    /// This indirection is used so that the controller is never blocked on a full channel.
    fn spawn_requeue(&self, name: Arc<String>, delay: Duration) {
        let tx = self.requeue_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _res = tx.send(name).await;
        });
    }
}

/// The backoff applied to the passes of a cluster which keep failing.
fn pass_backoff(initial: Duration, max: Duration) -> ExponentialBackoff {
    let mut backoff = ExponentialBackoff {
        initial_interval: initial,
        current_interval: initial,
        max_interval: max,
        max_elapsed_time: None,
        ..Default::default()
    };
    backoff.reset();
    backoff
}

/// Create a list params object which selects only objects managed by this operator.
fn list_params_cluster_selector_labels() -> ListParams {
    ListParams {
        label_selector: Some(QUORUM_OPERATOR_LABEL_SELECTORS.into()),
        ..Default::default()
    }
}

/// Set the canonical labels of objects managed by this operator.
pub(crate) fn set_cannonical_labels(labels: &mut BTreeMap<String, String>) {
    labels.insert(LABEL_K8S_APP.into(), LABEL_APP_VALUE.into());
    labels.insert(LABEL_CONTROLLED_BY.into(), LABEL_CONTROLLED_BY_VALUE.into());
}

/// Map the result of a Kubernetes API call made under a timeout to a collaborator error.
///
/// The action reads as the object of "error ..." and "timeout ...", e.g. `listing pods`.
pub(crate) fn api_result<T>(res: std::result::Result<std::result::Result<T, kube::Error>, Elapsed>, action: &str) -> std::result::Result<T, ReconcileError> {
    match res {
        Ok(Ok(val)) => Ok(val),
        Ok(Err(err)) => Err(ReconcileError::collaborator(format!("error {}: {}", action, err))),
        Err(_elapsed) => Err(ReconcileError::collaborator(format!("timeout {}", action))),
    }
}
