use anyhow::Result;

use crate::error::ReconcileError;
use crate::process_group::{process_group_id_from_process_id, ProcessClass, ProcessGroupId};

#[test]
fn parse_simple_ids() -> Result<()> {
    let id = ProcessGroupId::parse("storage-12")?;
    assert_eq!(id.class().as_str(), "storage");
    assert_eq!(id.index(), 12);

    let id = ProcessGroupId::parse("cluster_controller-3")?;
    assert_eq!(id.class().as_str(), "cluster_controller");
    assert_eq!(id.index(), 3);
    Ok(())
}

#[test]
fn parse_folds_prefix_into_class() -> Result<()> {
    let id = ProcessGroupId::parse("dc1-storage-12")?;
    assert_eq!(id.class().as_str(), "dc1-storage");
    assert_eq!(id.index(), 12);
    assert_eq!(id, ProcessGroupId::new(Some("dc1"), &ProcessClass::from("storage"), 12));
    Ok(())
}

#[test]
fn parse_rejects_malformed_ids() {
    for input in ["6", "storage", "storage-bad", "-6", "storage-", "storage-1a", ""] {
        let err = ProcessGroupId::parse(input).expect_err("expected parse failure");
        assert!(matches!(&err, ReconcileError::Parse(val) if val == input), "unexpected error for {:?}: {:?}", input, err);
    }
}

#[test]
fn parse_error_message_names_input() {
    let err = ProcessGroupId::parse("storage-bad").expect_err("expected parse failure");
    assert_eq!(err.to_string(), "could not parse process group ID storage-bad");
}

#[test]
fn format_is_inverse_of_parse() -> Result<()> {
    for input in ["storage-1", "log-42", "stateless-0", "cluster_controller-3", "dc1-storage-12", "us-east-1-log-7"] {
        let id: ProcessGroupId = input.parse()?;
        assert_eq!(id.to_string(), input, "round trip changed the id");
    }
    Ok(())
}

#[test]
fn new_without_prefix_keeps_class() {
    let id = ProcessGroupId::new(None, &ProcessClass::from("log"), 4);
    assert_eq!(id.to_string(), "log-4");
    let id = ProcessGroupId::new(Some(""), &ProcessClass::from("log"), 4);
    assert_eq!(id.to_string(), "log-4");
}

#[test]
fn process_group_id_from_process_ids() {
    assert_eq!(process_group_id_from_process_id("storage-1-1"), "storage-1");
    assert_eq!(process_group_id_from_process_id("dc1-storage-1-1"), "dc1-storage-1");
    assert_eq!(process_group_id_from_process_id("storage-2"), "storage-2");
    assert_eq!(process_group_id_from_process_id("storage"), "storage");
}
