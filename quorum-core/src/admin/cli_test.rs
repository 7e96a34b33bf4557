use std::time::Duration;

use anyhow::Result;

use super::*;
use crate::crd::{DatabaseCluster, DatabaseClusterSpec, DatabaseClusterStatus};
use crate::error::ReconcileError;

const BACKUP_STATUS: &str = r#"{"DestinationURL":"blobstore://backup","SnapshotIntervalSeconds":864000,"Status":{"Running":true},"BackupAgentsPaused":false}"#;

#[test]
fn warnings_are_stripped_before_decoding() -> Result<()> {
    let raw = format!("WARNING: the cluster is unavailable\nUsing cluster file `/var/run/quorum/db.cluster'.\n{}\n", BACKUP_STATUS);
    let stripped: LiveBackupStatus = serde_json::from_str(remove_warnings_in_json(&raw)?)?;
    let bare: LiveBackupStatus = serde_json::from_str(BACKUP_STATUS)?;
    assert_eq!(stripped, bare, "expected decoded status with warnings to match bare payload");
    assert_eq!(bare.destination_url, "blobstore://backup");
    assert_eq!(bare.snapshot_interval_seconds, 864_000);
    assert!(bare.status.running);
    assert!(!bare.backup_agents_paused);
    Ok(())
}

#[test]
fn bare_json_is_left_untouched() -> Result<()> {
    assert_eq!(remove_warnings_in_json(BACKUP_STATUS)?, BACKUP_STATUS);
    Ok(())
}

#[test]
fn output_without_json_is_a_collaborator_error() {
    let err = remove_warnings_in_json("WARNING: no backup\n").expect_err("expected missing document to be rejected");
    match err {
        ReconcileError::Collaborator { output, .. } => assert_eq!(output, "WARNING: no backup\n"),
        other => panic!("unexpected error variant: {:?}", other),
    }
}

#[test]
fn sparse_backup_status_uses_defaults() -> Result<()> {
    let status: LiveBackupStatus = serde_json::from_str("{}")?;
    assert_eq!(status, LiveBackupStatus::default());
    Ok(())
}

#[test]
fn exclusions_in_progress_from_database_status() -> Result<()> {
    let raw = r#"WARNING: long running status
{"cluster":{"processes":{
    "a1":{"locality":{"instance_id":"storage-1"},"excluded":true,"roles":[{"role":"storage"}]},
    "a2":{"locality":{"instance_id":"storage-2"},"excluded":true,"roles":[]},
    "a3":{"locality":{"instance_id":"storage-3"},"excluded":false,"roles":[]},
    "a4":{"locality":{"process_id":"log-1-1"},"excluded":true,"roles":[{"role":"log"}]},
    "a5":{"locality":{"instance_id":"storage-9"},"excluded":false,"roles":[{"role":"storage"}]}
}}}"#;
    let status = DatabaseStatus::decode(raw)?;
    let ids = ["storage-1", "storage-2", "storage-3", "log-1", "storage-4"]
        .iter()
        .map(|id| ProcessGroupId::parse(id))
        .collect::<Result<Vec<_>, _>>()?;

    let pending = status.exclusions_in_progress(&ids);
    let pending: Vec<String> = pending.iter().map(ToString::to_string).collect();
    assert_eq!(pending, vec!["storage-1", "storage-3", "log-1"]);
    Ok(())
}

#[test]
fn undecodable_status_is_a_collaborator_error() {
    let err = DatabaseStatus::decode("{\"cluster\": [").expect_err("expected decoding failure");
    let err = err.downcast::<ReconcileError>().expect("expected a reconcile error");
    assert!(matches!(err, ReconcileError::Collaborator { .. }), "unexpected error variant: {:?}", err);
}

#[tokio::test]
async fn client_without_connection_string_fails_commands() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path().to_path_buf());
    let mut cluster = DatabaseCluster::new("sample", serde_yaml::from_str::<DatabaseClusterSpec>("version: 7.1.25")?);
    cluster.metadata.namespace = Some("default".into());

    let client = CliAdminClient::for_cluster(&config, &cluster);
    let err = client.stop_backup().await.expect_err("expected command without connection string to fail");
    let err = err.downcast::<ReconcileError>().expect("expected a reconcile error");
    assert!(matches!(err, ReconcileError::Collaborator { .. }), "unexpected error variant: {:?}", err);
    assert!(!dir.path().join("default-sample.cluster").exists(), "expected no cluster file to be written");

    cluster.status = Some(DatabaseClusterStatus {
        connection_string: Some("sample:abc@10.0.0.1:4500".into()),
        ..Default::default()
    });
    let client = CliAdminClient::for_cluster(&config, &cluster);
    client.write_cluster_file().await?;
    assert_eq!(std::fs::read_to_string(dir.path().join("default-sample.cluster"))?, "sample:abc@10.0.0.1:4500");
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn backup_commands_run_the_backup_tool() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let script = write_script(
        &dir,
        "fake-backup",
        &format!("echo \"$@\" >> \"{}\"\necho 'WARNING: slow'\necho '{}'\n", dir.path().join("calls").display(), BACKUP_STATUS),
    )?;
    let mut config = test_config(dir.path().join("clusters"));
    config.backup_binary = script;
    let client = CliAdminClient::new(config, dir.path().join("clusters").join("db.cluster"), Some("db:abc@10.0.0.1:4500".into()));

    client.start_backup("blobstore://backup", 60).await?;
    client.modify_backup(120).await?;
    let status = client.get_backup_status().await?;
    assert!(status.status.running);

    let cluster_file = std::fs::read_to_string(dir.path().join("clusters").join("db.cluster"))?;
    assert_eq!(cluster_file, "db:abc@10.0.0.1:4500");
    let calls = std::fs::read_to_string(dir.path().join("calls"))?;
    let calls: Vec<&str> = calls.lines().collect();
    assert_eq!(calls.len(), 3);
    assert!(calls[0].starts_with("start -d blobstore://backup -s 60 -z -C "), "unexpected call: {}", calls[0]);
    assert!(calls[1].starts_with("modify -s 120 -C "), "unexpected call: {}", calls[1]);
    assert!(calls[2].starts_with("status --json -C "), "unexpected call: {}", calls[2]);
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn failing_tool_surfaces_captured_output() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let script = write_script(&dir, "fake-backup", "echo 'ERROR: no backup agents' >&2\nexit 1\n")?;
    let mut config = test_config(dir.path().to_path_buf());
    config.backup_binary = script;
    let client = CliAdminClient::new(config, dir.path().join("db.cluster"), Some("db:abc@10.0.0.1:4500".into()));

    let err = client.pause_backups().await.expect_err("expected non-zero exit to fail");
    let err = err.downcast::<ReconcileError>().expect("expected a reconcile error");
    match err {
        ReconcileError::Collaborator { output, .. } => assert!(output.contains("ERROR: no backup agents"), "unexpected output: {}", output),
        other => panic!("unexpected error variant: {:?}", other),
    }
    Ok(())
}

fn test_config(cluster_file_dir: std::path::PathBuf) -> AdminConfig {
    AdminConfig {
        admin_binary: "fdbcli".into(),
        backup_binary: "fdbbackup".into(),
        cluster_file_dir,
        timeout: Duration::from_secs(10),
    }
}

#[cfg(unix)]
fn write_script(dir: &tempfile::TempDir, name: &str, body: &str) -> Result<String> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.path().join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}", body))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path.display().to_string())
}
