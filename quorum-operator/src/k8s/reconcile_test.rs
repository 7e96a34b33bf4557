use std::sync::Arc;

use anyhow::{bail, Result};

use super::api_result;
use super::reconcile::record_failure;
use crate::fixtures::{self, FakeAdmin, FakeRecorder, FakeUnits};
use crate::pipeline::{PassOutcome, Pipeline};
use crate::recorder::EventType;
use quorum_core::ReconcileError;

#[tokio::test]
async fn unreachable_api_is_recorded_as_collaborator_error() -> Result<()> {
    let (units, admin, recorder) = (Arc::new(FakeUnits::default()), Arc::new(FakeAdmin::default()), Arc::new(FakeRecorder::default()));
    let ctx = fixtures::context(&units, &admin, &recorder);
    let mut cluster = fixtures::cluster("6.3.23", &[("storage", 3)], 1);
    units.set_api_down(true);

    let outcome = Pipeline::standard().run(&ctx, &mut cluster).await;

    let (step, error) = match &outcome {
        PassOutcome::Failed { step, error, .. } => (*step, error),
        other => bail!("expected pass to fail, got {:?}", other),
    };
    record_failure(&ctx, &cluster, step, error).await;
    let warnings = recorder.reasons(EventType::Warning);
    assert!(warnings == vec!["CollaboratorError".to_string()], "unexpected warnings {:?}", warnings);
    let messages = recorder.messages("CollaboratorError");
    assert!(
        messages.iter().any(|message| message.contains("error listing pods") && message.contains("unable to handle the request")),
        "expected the API error in the event message, got {:?}",
        messages
    );
    Ok(())
}

#[tokio::test]
async fn failure_without_known_cause_uses_generic_reason() {
    let (units, admin, recorder) = (Arc::new(FakeUnits::default()), Arc::new(FakeAdmin::default()), Arc::new(FakeRecorder::default()));
    let ctx = fixtures::context(&units, &admin, &recorder);
    let cluster = fixtures::cluster("6.3.23", &[("storage", 3)], 1);

    record_failure(&ctx, &cluster, "AddUnits", &anyhow::anyhow!("something went wrong")).await;

    let warnings = recorder.reasons(EventType::Warning);
    assert!(warnings == vec!["ReconciliationFailed".to_string()], "unexpected warnings {:?}", warnings);
}

#[tokio::test]
async fn api_timeout_is_a_collaborator_error() -> Result<()> {
    let elapsed = match tokio::time::timeout(std::time::Duration::from_millis(1), futures::future::pending::<()>()).await {
        Ok(_) => bail!("expected the pending future to time out"),
        Err(elapsed) => elapsed,
    };

    let res = api_result::<()>(Err(elapsed), "listing pods");

    match res {
        Err(err @ ReconcileError::Collaborator { .. }) => {
            assert!(err.to_string() == "timeout listing pods", "unexpected message {}", err);
        }
        other => bail!("expected a collaborator error, got {:?}", other),
    }
    Ok(())
}
