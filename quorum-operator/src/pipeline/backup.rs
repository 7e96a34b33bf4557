use anyhow::{Context, Result};

use crate::pipeline::{PassContext, StepResult, Subreconciler};
use crate::recorder::EventType;
use quorum_core::admin::LiveBackupStatus;
use quorum_core::crd::{BackupSpec, BackupState, DatabaseCluster, RequiredMetadata};

/// Converge the cluster's continuous backup to the desired backup state.
///
/// Clusters without a backup spec are left alone.
pub struct ReconcileBackup;

#[async_trait::async_trait]
impl Subreconciler for ReconcileBackup {
    fn name(&self) -> &'static str {
        "ReconcileBackup"
    }

    async fn reconcile(&self, ctx: &PassContext, cluster: &mut DatabaseCluster) -> StepResult {
        self.reconcile_backup(ctx, cluster).await.into()
    }
}

/// A single change to apply to a live backup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) enum BackupAction {
    Start { url: String, snapshot_period_seconds: u32 },
    Modify { snapshot_period_seconds: u32 },
    Pause,
    Resume,
    Stop,
}

/// Compute the changes needed to move the live backup to the desired one, in order.
pub(super) fn plan_backup(desired: &BackupSpec, live: &LiveBackupStatus) -> Vec<BackupAction> {
    let mut actions = Vec::new();
    let running = live.status.running;
    match desired.state {
        BackupState::Running | BackupState::Paused if !running => {
            actions.push(BackupAction::Start {
                url: desired.url.clone(),
                snapshot_period_seconds: desired.snapshot_period_seconds,
            });
            if desired.state == BackupState::Paused {
                actions.push(BackupAction::Pause);
            }
        }
        BackupState::Running => {
            if live.snapshot_interval_seconds != desired.snapshot_period_seconds {
                actions.push(BackupAction::Modify {
                    snapshot_period_seconds: desired.snapshot_period_seconds,
                });
            }
            if live.backup_agents_paused {
                actions.push(BackupAction::Resume);
            }
        }
        BackupState::Paused => {
            if !live.backup_agents_paused {
                actions.push(BackupAction::Pause);
            }
        }
        BackupState::Stopped if running => actions.push(BackupAction::Stop),
        BackupState::Stopped => (),
    }
    actions
}

impl ReconcileBackup {
    #[tracing::instrument(level = "debug", skip(self, ctx, cluster), fields(cluster = %cluster.name()))]
    async fn reconcile_backup(&self, ctx: &PassContext, cluster: &mut DatabaseCluster) -> Result<StepResult> {
        let desired = match cluster.spec.backup.clone() {
            Some(desired) => desired,
            None => return Ok(StepResult::Advance),
        };
        let live = ctx.admin.get_backup_status().await.context("error fetching backup status")?;
        let actions = plan_backup(&desired, &live);
        if actions.is_empty() {
            return Ok(StepResult::Advance);
        }

        let generation = cluster.generation();
        cluster.status_mut().generations.needs_backup_change = Some(generation);
        for action in actions {
            tracing::info!(?action, "changing backup");
            let (reason, message) = match &action {
                BackupAction::Start { url, snapshot_period_seconds } => {
                    ctx.admin.start_backup(url, *snapshot_period_seconds).await.context("error starting backup")?;
                    ("BackupStarted", format!("Started backup to {}", url))
                }
                BackupAction::Modify { snapshot_period_seconds } => {
                    ctx.admin.modify_backup(*snapshot_period_seconds).await.context("error modifying backup")?;
                    ("BackupModified", format!("Snapshot period set to {}s", snapshot_period_seconds))
                }
                BackupAction::Pause => {
                    ctx.admin.pause_backups().await.context("error pausing backups")?;
                    ("BackupPaused", "Paused backup agents".to_string())
                }
                BackupAction::Resume => {
                    ctx.admin.resume_backups().await.context("error resuming backups")?;
                    ("BackupResumed", "Resumed backup agents".to_string())
                }
                BackupAction::Stop => {
                    ctx.admin.stop_backup().await.context("error stopping backup")?;
                    ("BackupStopped", "Stopped backup".to_string())
                }
            };
            ctx.recorder.record(cluster, EventType::Normal, reason, &message).await;
        }
        Ok(StepResult::Advance)
    }
}
