use anyhow::Result;
use structopt::StructOpt;

use super::{resolve_cluster_file, Quorum, QuorumSubcommands};

#[tokio::test]
async fn resolve_cluster_file_reads_connection_string_from_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db.cluster");
    std::fs::write(&path, "sample:abc@10.0.0.1:4500\n")?;

    let (file, conn) = resolve_cluster_file(Some(path.as_path()), None).await?;

    assert!(file == path, "unexpected cluster file {}", file.display());
    assert!(conn == "sample:abc@10.0.0.1:4500", "expected a trimmed connection string, got {:?}", conn);
    Ok(())
}

#[tokio::test]
async fn resolve_cluster_file_prefers_given_connection_string() -> Result<()> {
    let (file, conn) = resolve_cluster_file(None, Some("sample:abc@10.0.0.1:4500")).await?;

    assert!(file.ends_with("quorum-cli.cluster"), "unexpected default cluster file {}", file.display());
    assert!(conn == "sample:abc@10.0.0.1:4500", "unexpected connection string {:?}", conn);
    Ok(())
}

#[tokio::test]
async fn resolve_cluster_file_rejects_missing_and_empty_inputs() -> Result<()> {
    let res = resolve_cluster_file(None, None).await;
    assert!(res.is_err(), "expected an error without a cluster file or connection string");

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("empty.cluster");
    std::fs::write(&path, " \n")?;
    let res = resolve_cluster_file(Some(path.as_path()), None).await;
    assert!(res.is_err(), "expected an error for an empty cluster file");
    Ok(())
}

#[test]
fn exclude_parses_and_normalizes_ids() -> Result<()> {
    let cli = Quorum::from_iter_safe(vec!["quorum", "--connection-string", "sample:abc@10.0.0.1:4500", "exclude", "storage-01", "log-2"])?;

    let ids = match cli.action {
        QuorumSubcommands::Exclude(inner) => inner.ids.iter().map(ToString::to_string).collect::<Vec<_>>(),
        _ => anyhow::bail!("expected the exclude subcommand"),
    };
    assert!(ids == vec!["storage-1", "log-2"], "unexpected IDs {:?}", ids);
    Ok(())
}

#[test]
fn exclude_rejects_invalid_ids() {
    let res = Quorum::from_iter_safe(vec!["quorum", "--connection-string", "x", "exclude", "storage"]);
    assert!(res.is_err(), "expected an ID without index to be rejected");
}

#[test]
fn backup_start_requires_url() {
    let res = Quorum::from_iter_safe(vec!["quorum", "--connection-string", "x", "backup", "start"]);
    assert!(res.is_err(), "expected backup start without --url to be rejected");

    let res = Quorum::from_iter_safe(vec!["quorum", "--connection-string", "x", "backup", "start", "--url", "blobstore://host/bucket"]);
    assert!(res.is_ok(), "expected backup start with --url to parse");
}
