use anyhow::{bail, Result};
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use super::units::{build_unit_pod, pod_to_unit, unit_label_selector};
use crate::fixtures;
use crate::units::{UnitSelector, CONTAINER_MAIN, CONTAINER_SIDECAR};
use quorum_core::crd::ProcessGroupStatus;
use quorum_core::{ProcessClass, ProcessGroupId, LABEL_CLUSTER, LABEL_FAULT_DOMAIN, LABEL_PROCESS_CLASS, LABEL_PROCESS_GROUP_ID};

fn group(id: &str, class: &str) -> Result<ProcessGroupStatus> {
    Ok(ProcessGroupStatus::new(&ProcessGroupId::parse(id)?, &ProcessClass::from(class)))
}

fn ready_condition(status: &str) -> PodStatus {
    PodStatus {
        conditions: Some(vec![PodCondition {
            type_: "Ready".into(),
            status: status.into(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

#[test]
fn build_unit_pod_sets_labels_images_and_owner() -> Result<()> {
    let cluster = fixtures::cluster("6.3.23", &[("storage", 1)], 1);
    let group = group("storage-1", "storage")?;

    let pod = build_unit_pod(&cluster, &group)?;

    let labels = pod.metadata.labels.clone().unwrap_or_default();
    assert!(pod.metadata.name.as_deref() == Some("test-storage-1"), "unexpected pod name {:?}", pod.metadata.name);
    assert!(labels.get(LABEL_CLUSTER).map(String::as_str) == Some("test"), "unexpected cluster label {:?}", labels);
    assert!(labels.get(LABEL_PROCESS_GROUP_ID).map(String::as_str) == Some("storage-1"), "unexpected ID label {:?}", labels);
    assert!(labels.get(LABEL_PROCESS_CLASS).map(String::as_str) == Some("storage"), "unexpected class label {:?}", labels);
    assert!(labels.get("app").map(String::as_str) == Some("quorum"), "expected canonical labels, got {:?}", labels);
    let owners = pod.metadata.owner_references.clone().unwrap_or_default();
    assert!(owners.len() == 1 && owners[0].kind == "DatabaseCluster", "unexpected owner references {:?}", owners);

    let unit = pod_to_unit(&pod);
    assert!(
        unit.image(CONTAINER_MAIN) == Some("foundationdb/foundationdb:6.3.23"),
        "unexpected main image {:?}",
        unit.image(CONTAINER_MAIN)
    );
    assert!(
        unit.image(CONTAINER_SIDECAR) == Some("foundationdb/foundationdb-kubernetes-sidecar:6.3.23-1"),
        "unexpected sidecar image {:?}",
        unit.image(CONTAINER_SIDECAR)
    );
    Ok(())
}

#[test]
fn build_unit_pod_sanitizes_underscored_classes() -> Result<()> {
    let cluster = fixtures::cluster("6.3.23", &[("cluster_controller", 1)], 1);
    let group = group("cluster_controller-1", "cluster_controller")?;

    let pod = build_unit_pod(&cluster, &group)?;

    assert!(
        pod.metadata.name.as_deref() == Some("test-cluster-controller-1"),
        "unexpected pod name {:?}",
        pod.metadata.name
    );
    let id = pod.metadata.labels.unwrap_or_default().remove(LABEL_PROCESS_GROUP_ID);
    assert!(id.as_deref() == Some("cluster_controller-1"), "expected the label to keep the raw ID, got {:?}", id);
    Ok(())
}

#[test]
fn build_unit_pod_rejects_tagged_images() -> Result<()> {
    let mut cluster = fixtures::cluster("6.3.23", &[("storage", 1)], 1);
    cluster.spec.main_container.image_name = Some("foundationdb/foundationdb:7.1.0".into());

    match build_unit_pod(&cluster, &group("storage-1", "storage")?) {
        Ok(pod) => bail!("expected an invalid spec error, got pod {:?}", pod.metadata.name),
        Err(err) => assert!(err.to_string().contains("contains the tag"), "unexpected error {}", err),
    }
    Ok(())
}

#[test]
fn pod_to_unit_reads_readiness_and_termination() -> Result<()> {
    let cluster = fixtures::cluster("6.3.23", &[("storage", 1)], 1);
    let mut pod = build_unit_pod(&cluster, &group("storage-1", "storage")?)?;

    let unit = pod_to_unit(&pod);
    assert!(!unit.ready, "expected a pod without status to be unready");
    assert!(!unit.terminating, "expected a fresh pod not to be terminating");

    pod.status = Some(ready_condition("True"));
    let unit = pod_to_unit(&pod);
    assert!(unit.ready && unit.is_available(), "expected a ready pod to be available");

    pod.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    let unit = pod_to_unit(&pod);
    assert!(unit.terminating && !unit.is_available(), "expected a deleted pod to be unavailable");

    pod.status = Some(ready_condition("False"));
    let unit = pod_to_unit(&pod);
    assert!(!unit.ready, "expected a pod with a false ready condition to be unready");
    Ok(())
}

#[test]
fn pod_to_unit_derives_fault_domain() -> Result<()> {
    let cluster = fixtures::cluster("6.3.23", &[("storage", 1)], 1);
    let mut pod: Pod = build_unit_pod(&cluster, &group("storage-1", "storage")?)?;
    assert!(pod_to_unit(&pod).fault_domain == "test-storage-1", "expected the pod name as last resort");

    if let Some(spec) = pod.spec.as_mut() {
        spec.node_name = Some("node-a".into());
    }
    assert!(pod_to_unit(&pod).fault_domain == "node-a", "expected the node name as fault domain");

    if let Some(labels) = pod.metadata.labels.as_mut() {
        labels.insert(LABEL_FAULT_DOMAIN.into(), "zone-1".into());
    }
    assert!(pod_to_unit(&pod).fault_domain == "zone-1", "expected the fault domain label to win");
    Ok(())
}

#[test]
fn unit_label_selector_narrows_by_class_and_ids() {
    let cluster = fixtures::cluster("6.3.23", &[("storage", 1)], 1);

    let all = unit_label_selector(&cluster, &UnitSelector::all());
    assert!(all == "quorum.rs/cluster=test", "unexpected selector {}", all);

    let mut selector = UnitSelector::process_groups(vec!["storage-2", "storage-1"]);
    selector.process_class = Some(ProcessClass::from("storage"));
    let narrowed = unit_label_selector(&cluster, &selector);
    assert!(
        narrowed == "quorum.rs/cluster=test,quorum.rs/process-class=storage,quorum.rs/process-group-id in (storage-1,storage-2)",
        "unexpected selector {}",
        narrowed
    );
}
