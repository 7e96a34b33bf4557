//! Reconciliation passes.
//!
//! Each pass runs on its own task against a private snapshot of a cluster. The controller hands
//! out at most one pass per cluster at a time, bounded overall by the worker semaphore, and is
//! told about the result of every pass through a channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use kube::api::{Api, Patch, PatchParams};
use kube::client::Client;
use tokio::sync::{broadcast, mpsc, oneshot, OwnedSemaphorePermit};
use tokio::time::timeout;

use crate::config::Config;
use crate::k8s::coordination::LeaseFence;
use crate::k8s::{api_result, APP_NAME};
use crate::pipeline::{PassContext, PassOutcome, Pipeline};
use crate::recorder::EventType;
use quorum_core::crd::{DatabaseCluster, RequiredMetadata};
use quorum_core::ReconcileError;

pub(crate) const METRIC_PASSES: &str = "quorum_operator_passes_total";
pub(crate) const METRIC_PASS_DURATION: &str = "quorum_operator_pass_duration_seconds";
pub(crate) const METRIC_WATCHER_ERRORS: &str = "quorum_operator_watcher_errors";

/// The event reason of failed passes which carry no more specific reason.
const REASON_RECONCILIATION_FAILED: &str = "ReconciliationFailed";

/// Register the metrics of the reconciliation subsystem.
pub(crate) fn register_metrics() {
    metrics::register_counter!(METRIC_PASSES, metrics::Unit::Count, "the number of reconciliation passes, by outcome");
    metrics::register_histogram!(METRIC_PASS_DURATION, metrics::Unit::Seconds, "the duration of reconciliation passes");
    metrics::register_counter!(METRIC_WATCHER_ERRORS, metrics::Unit::Count, "the number of errors returned from K8s watchers");
}

/// The result of a pass, as seen by the controller.
#[derive(Debug, PartialEq)]
pub(crate) enum PassResult {
    Complete,
    /// Retry after the given minimum delay.
    Blocked(Duration),
    /// Retry with backoff.
    Failed,
    /// The pass was stopped before finishing, no retry is scheduled.
    Cancelled,
}

/// The message sent to the controller when a pass is done.
#[derive(Debug)]
pub(crate) struct PassDone {
    pub name: Arc<String>,
    pub result: PassResult,
    /// The cluster as returned by the API after its status was persisted.
    pub updated: Option<DatabaseCluster>,
}

/// Everything needed to run a single pass on its own task.
pub(crate) struct PassTask {
    pub name: Arc<String>,
    pub cluster: DatabaseCluster,
    pub ctx: PassContext,
    pub pipeline: Arc<Pipeline>,
    pub config: Arc<Config>,
    pub client: Client,
    pub fence: LeaseFence,
    pub shutdown: broadcast::Receiver<()>,
    pub cancel: oneshot::Receiver<()>,
    pub done_tx: mpsc::Sender<PassDone>,
    pub permit: OwnedSemaphorePermit,
}

impl PassTask {
    pub fn spawn(self) {
        tokio::spawn(self.run());
    }

    #[tracing::instrument(level = "debug", skip(self), fields(cluster = %self.name))]
    async fn run(self) {
        let Self {
            name,
            mut cluster,
            ctx,
            pipeline,
            config,
            client,
            fence,
            mut shutdown,
            cancel,
            done_tx,
            permit,
        } = self;
        let started = Instant::now();
        let original_status = cluster.status.clone();

        let outcome = tokio::select! {
            res = timeout(config.pass_timeout(), pipeline.run(&ctx, &mut cluster)) => Some(res),
            _ = shutdown.recv() => {
                tracing::debug!("pass cancelled by shutdown");
                None
            }
            _ = cancel => {
                tracing::debug!("pass cancelled");
                None
            }
        };
        metrics::histogram!(METRIC_PASS_DURATION, started.elapsed().as_secs_f64());

        let mut updated = None;
        let result = match outcome {
            // A pass interrupted by a timeout has made progress only through idempotent steps, so
            // it is simply retried. Its status snapshot is discarded.
            Some(Err(_elapsed)) => {
                tracing::error!(timeout = ?config.pass_timeout(), "reconciliation pass timed out");
                metrics::increment_counter!(METRIC_PASSES, "outcome" => "timeout");
                PassResult::Failed
            }
            None => PassResult::Cancelled,
            Some(Ok(outcome)) => {
                metrics::increment_counter!(METRIC_PASSES, "outcome" => outcome.label());
                let mut result = match &outcome {
                    PassOutcome::Complete => {
                        tracing::info!(generation = cluster.generation(), "cluster reconciled");
                        PassResult::Complete
                    }
                    PassOutcome::Blocked { step, reason, requeue_after, .. } => {
                        tracing::info!(%step, %reason, "reconciliation blocked");
                        PassResult::Blocked(*requeue_after)
                    }
                    PassOutcome::Failed { step, error, .. } => {
                        tracing::error!(%step, error = ?error, "reconciliation failed");
                        record_failure(&ctx, &cluster, step, error).await;
                        PassResult::Failed
                    }
                };

                if cluster.status != original_status {
                    match persist_status(&client, &fence, &config, &cluster).await {
                        Ok(cluster) => updated = Some(cluster),
                        Err(err) => {
                            tracing::error!(error = ?err, "error persisting cluster status");
                            result = PassResult::Failed;
                        }
                    }
                }
                result
            }
        };

        // Free the worker before reporting, so that the controller can hand out the next pass.
        drop(permit);
        let _ = done_tx.send(PassDone { name, result, updated }).await;
    }
}

/// Persist the status of the given cluster using Server-Side Apply.
///
/// The resource version of the snapshot is sent along, so a status computed from stale data is
/// rejected by the API server.
#[tracing::instrument(level = "debug", skip(client, fence, config, cluster), fields(cluster = %cluster.name()))]
async fn persist_status(client: &Client, fence: &LeaseFence, config: &Config, cluster: &DatabaseCluster) -> Result<DatabaseCluster> {
    fence.check().await?;
    let api: Api<DatabaseCluster> = Api::namespaced(client.clone(), cluster.namespace());
    let mut params = PatchParams::apply(APP_NAME);
    params.force = true;
    let mut cluster = cluster.clone();
    cluster.metadata.managed_fields = None;
    let updated = api_result(
        timeout(config.api_timeout(), api.patch_status(cluster.name(), &params, &Patch::Apply(&cluster))).await,
        "updating cluster status",
    )?;
    Ok(updated)
}

/// Record a Warning event for a pass which failed in the given step.
///
/// The event reason is the one of the underlying `ReconcileError`, if any.
pub(crate) async fn record_failure(ctx: &PassContext, cluster: &DatabaseCluster, step: &str, error: &anyhow::Error) {
    let reason = error
        .downcast_ref::<ReconcileError>()
        .map(ReconcileError::reason)
        .unwrap_or(REASON_RECONCILIATION_FAILED);
    ctx.recorder
        .record(cluster, EventType::Warning, reason, &format!("step {} failed: {:#}", step, error))
        .await;
}
