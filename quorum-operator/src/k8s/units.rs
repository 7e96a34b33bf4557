//! Workload units backed by Kubernetes Pods.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Container, EnvVar, EnvVarSource, ObjectFieldSelector, Pod, PodSpec};
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::client::Client;
use kube::Resource;
use tokio::time::timeout;

use crate::k8s::coordination::LeaseFence;
use crate::k8s::{api_result, set_cannonical_labels, APP_NAME};
use crate::units::{UnitContainer, UnitManager, UnitSelector, WorkloadUnit, CONTAINER_MAIN, CONTAINER_SIDECAR};
use quorum_core::crd::{DatabaseCluster, ProcessGroupStatus, RequiredMetadata};
use quorum_core::{LABEL_CLUSTER, LABEL_FAULT_DOMAIN, LABEL_PROCESS_CLASS, LABEL_PROCESS_GROUP_ID};

/// A unit manager operating on the Pods of a cluster.
pub struct KubeUnitManager {
    client: Client,
    fence: LeaseFence,
    api_timeout: Duration,
}

impl KubeUnitManager {
    pub fn new(client: Client, fence: LeaseFence, api_timeout: Duration) -> Self {
        Self { client, fence, api_timeout }
    }

    fn api(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl UnitManager for KubeUnitManager {
    #[tracing::instrument(level = "debug", skip(self, cluster, selector), fields(cluster = %cluster.name()))]
    async fn list_units(&self, cluster: &DatabaseCluster, selector: &UnitSelector) -> Result<Vec<WorkloadUnit>> {
        if matches!(&selector.process_group_ids, Some(ids) if ids.is_empty()) {
            return Ok(vec![]);
        }
        let params = ListParams {
            label_selector: Some(unit_label_selector(cluster, selector)),
            ..Default::default()
        };
        let pods = api_result(timeout(self.api_timeout, self.api(cluster.namespace()).list(&params)).await, "listing pods")?;
        Ok(pods.items.iter().map(pod_to_unit).filter(|unit| selector.matches(unit)).collect())
    }

    #[tracing::instrument(level = "debug", skip(self, cluster, group), fields(cluster = %cluster.name(), process_group = %group.process_group_id))]
    async fn create_unit(&self, cluster: &DatabaseCluster, group: &ProcessGroupStatus) -> Result<()> {
        let pod = build_unit_pod(cluster, group)?;
        self.fence.check().await?;
        api_result(
            timeout(self.api_timeout, self.api(cluster.namespace()).create(&PostParams::default(), &pod)).await,
            "creating pod",
        )?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, unit), fields(unit = %unit.name))]
    async fn update_image(&self, unit: &WorkloadUnit, container_index: usize, image: &str) -> Result<()> {
        let container = unit
            .containers
            .get(container_index)
            .with_context(|| format!("unit {} has no container at index {}", unit.name, container_index))?;
        // Containers are merged by name, which leaves all other containers untouched.
        let patch = serde_json::json!({
            "spec": {
                "containers": [{"name": container.name, "image": image}],
            },
        });
        self.fence.check().await?;
        let params = PatchParams {
            field_manager: Some(APP_NAME.into()),
            ..Default::default()
        };
        api_result(
            timeout(self.api_timeout, self.api(&unit.namespace).patch(&unit.name, &params, &Patch::Strategic(&patch))).await,
            "patching pod image",
        )?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, unit), fields(unit = %unit.name))]
    async fn delete_unit(&self, unit: &WorkloadUnit) -> Result<()> {
        self.fence.check().await?;
        let res = timeout(self.api_timeout, self.api(&unit.namespace).delete(&unit.name, &DeleteParams::default())).await;
        match res {
            Ok(Err(kube::Error::Api(api_err))) if api_err.code == http::StatusCode::NOT_FOUND => Ok(()),
            res => api_result(res, "deleting pod").map(|_| ()).map_err(Into::into),
        }
    }
}

/// Build the label selector matching the Pods of the given cluster and selector.
pub fn unit_label_selector(cluster: &DatabaseCluster, selector: &UnitSelector) -> String {
    let mut terms = vec![format!("{}={}", LABEL_CLUSTER, cluster.name())];
    if let Some(class) = &selector.process_class {
        terms.push(format!("{}={}", LABEL_PROCESS_CLASS, class));
    }
    if let Some(ids) = &selector.process_group_ids {
        let ids = ids.iter().map(String::as_str).collect::<Vec<_>>().join(",");
        terms.push(format!("{} in ({})", LABEL_PROCESS_GROUP_ID, ids));
    }
    terms.join(",")
}

/// Map a Pod to the workload unit it backs.
pub fn pod_to_unit(pod: &Pod) -> WorkloadUnit {
    let meta = pod.meta();
    let name = meta.name.clone().unwrap_or_default();
    let labels = meta.labels.clone().unwrap_or_default();
    let spec = pod.spec.as_ref();
    let ready = pod
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| conditions.iter().any(|cond| cond.type_ == "Ready" && cond.status == "True"))
        .unwrap_or(false);
    let fault_domain = labels
        .get(LABEL_FAULT_DOMAIN)
        .cloned()
        .or_else(|| spec.and_then(|spec| spec.node_name.clone()))
        .unwrap_or_else(|| name.clone());
    WorkloadUnit {
        namespace: meta.namespace.clone().unwrap_or_default(),
        process_group_id: labels.get(LABEL_PROCESS_GROUP_ID).cloned(),
        process_class: labels.get(LABEL_PROCESS_CLASS).cloned(),
        containers: spec
            .map(|spec| {
                spec.containers
                    .iter()
                    .map(|container| UnitContainer {
                        name: container.name.clone(),
                        image: container.image.clone().unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default(),
        ready,
        terminating: meta.deletion_timestamp.is_some(),
        fault_domain,
        labels,
        name,
    }
}

/// The name of the Pod backing the given process group.
///
/// Pod names may not contain underscores, which process classes such as `cluster_controller` do.
pub fn unit_name(cluster: &DatabaseCluster, group: &ProcessGroupStatus) -> String {
    format!("{}-{}", cluster.name(), group.process_group_id.replace('_', "-"))
}

/// Build the Pod backing the given process group.
#[tracing::instrument(level = "debug", skip(cluster, group), fields(cluster = %cluster.name(), process_group = %group.process_group_id))]
pub fn build_unit_pod(cluster: &DatabaseCluster, group: &ProcessGroupStatus) -> Result<Pod> {
    let class = group.class();
    let main_image = cluster.main_image(&class)?;
    let sidecar_image = cluster.sidecar_image(&class)?;

    let mut labels = BTreeMap::new();
    set_cannonical_labels(&mut labels);
    labels.insert(LABEL_CLUSTER.into(), cluster.name().into());
    labels.insert(LABEL_PROCESS_GROUP_ID.into(), group.process_group_id.clone());
    labels.insert(LABEL_PROCESS_CLASS.into(), group.process_class.clone());

    let env = vec![
        EnvVar {
            name: "FDB_PROCESS_CLASS".into(),
            value: Some(group.process_class.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "FDB_INSTANCE_ID".into(),
            value: Some(group.process_group_id.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "FDB_PUBLIC_IP".into(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "status.podIP".into(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        EnvVar {
            name: "FDB_MACHINE_ID".into(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "spec.nodeName".into(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(unit_name(cluster, group)),
            namespace: Some(cluster.namespace().into()),
            labels: Some(labels),
            owner_references: cluster.controller_owner_ref(&()).map(|owner| vec![owner]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            termination_grace_period_seconds: Some(30),
            containers: vec![
                // NOTE WELL: containers are looked up by name, do not rename them.
                Container {
                    name: CONTAINER_MAIN.into(),
                    image: Some(main_image),
                    image_pull_policy: Some("IfNotPresent".into()),
                    env: Some(env.clone()),
                    ..Default::default()
                },
                Container {
                    name: CONTAINER_SIDECAR.into(),
                    image: Some(sidecar_image),
                    image_pull_policy: Some("IfNotPresent".into()),
                    env: Some(env),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }),
        status: None,
    })
}
