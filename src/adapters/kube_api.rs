//! `ClusterApi` over a live Kubernetes client

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, PodTemplateSpec, ReplicationController};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use super::{ClusterApi, Workload, FIELD_MANAGER};
use crate::crd::{BackupPolicy, WorkloadKind};
use crate::error::{Error, Result};
use crate::mutator::selector;

/// API server access through `kube::Client`
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Pod selector and template of one workload object
type Parts = (Option<LabelSelector>, Option<PodTemplateSpec>);

fn deployment_parts(d: &Deployment) -> Parts {
    d.spec
        .as_ref()
        .map_or((None, None), |s| (Some(s.selector.clone()), Some(s.template.clone())))
}

fn statefulset_parts(s: &StatefulSet) -> Parts {
    s.spec
        .as_ref()
        .map_or((None, None), |s| (Some(s.selector.clone()), Some(s.template.clone())))
}

fn daemonset_parts(d: &DaemonSet) -> Parts {
    d.spec
        .as_ref()
        .map_or((None, None), |s| (Some(s.selector.clone()), Some(s.template.clone())))
}

fn replicaset_parts(r: &ReplicaSet) -> Parts {
    r.spec
        .as_ref()
        .map_or((None, None), |s| (Some(s.selector.clone()), s.template.clone()))
}

fn replication_controller_parts(rc: &ReplicationController) -> Parts {
    rc.spec.as_ref().map_or((None, None), |s| {
        let selector = s.selector.clone().map(|labels| LabelSelector {
            match_labels: Some(labels),
            ..Default::default()
        });
        (selector, s.template.clone())
    })
}

fn to_workload<K>(kind: WorkloadKind, obj: &K, parts: fn(&K) -> Parts) -> Option<Workload>
where
    K: Resource,
{
    let (selector, template) = parts(obj);
    Some(Workload {
        kind,
        namespace: obj.namespace()?,
        name: obj.name_any(),
        resource_version: obj.resource_version(),
        selector,
        template: template?,
    })
}

impl KubeClusterApi {
    async fn list_kind<K>(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        parts: fn(&K) -> Parts,
    ) -> Result<Vec<Workload>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let list = self
            .api::<K>(namespace)
            .list(&ListParams::default())
            .await?;
        Ok(list
            .items
            .iter()
            .filter_map(|obj| to_workload(kind, obj, parts))
            .collect())
    }

    async fn get_kind<K>(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        parts: fn(&K) -> Parts,
    ) -> Result<Workload>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let what = format!("{} {}/{}", kind, namespace, name);
        let obj = self
            .api::<K>(namespace)
            .get(name)
            .await
            .map_err(|e| Error::from_api(e, what.clone()))?;
        to_workload(kind, &obj, parts)
            .ok_or_else(|| Error::NotFound(format!("pod template of {}", what)))
    }

    async fn patch_template<K>(&self, workload: &Workload, template: PodTemplateSpec) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let patch = template_patch(workload, &template)?;
        self.api::<K>(&workload.namespace)
            .patch(&workload.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await
            .map_err(|e| {
                Error::from_api(e, format!("{} {}/{}", workload.kind, workload.namespace, workload.name))
            })?;
        Ok(())
    }
}

/// Merge patch that replaces a workload's pod template.
///
/// Merge patches replace list fields wholesale but leave absent keys alone,
/// so a template without volumes must say `volumes: null` to drop them.
pub fn template_patch(workload: &Workload, template: &PodTemplateSpec) -> Result<serde_json::Value> {
    let mut template = serde_json::to_value(template)?;
    if let Some(spec) = template.get_mut("spec").and_then(|s| s.as_object_mut()) {
        spec.entry("volumes").or_insert(serde_json::Value::Null);
    }
    Ok(json!({
        "metadata": { "resourceVersion": workload.resource_version },
        "spec": { "template": template },
    }))
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn create_job(&self, job: &Job) -> Result<Job> {
        let namespace = job.namespace().unwrap_or_else(|| "default".to_string());
        self.api::<Job>(&namespace)
            .create(&PostParams::default(), job)
            .await
            .map_err(|e| Error::from_api(e, format!("job {}/{}", namespace, job.name_any())))
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Job> {
        self.api::<Job>(namespace)
            .get(name)
            .await
            .map_err(|e| Error::from_api(e, format!("job {}/{}", namespace, name)))
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        self.api::<Job>(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| Error::from_api(e, format!("job {}/{}", namespace, name)))?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(&selector::to_query(selector));
        Ok(self.api::<Pod>(namespace).list(&params).await?.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.api::<Pod>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_api(e, format!("pod {}/{}", namespace, name)))?;
        Ok(())
    }

    async fn delete_pods(&self, namespace: &str, selector: &LabelSelector) -> Result<()> {
        let query = selector::to_query(selector);
        debug!(namespace, selector = %query, "Deleting pods");
        self.api::<Pod>(namespace)
            .delete_collection(&DeleteParams::default(), &ListParams::default().labels(&query))
            .await?;
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        self.api::<ConfigMap>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_api(e, format!("configmap {}/{}", namespace, name)))?;
        Ok(())
    }

    async fn list_workloads(&self, kind: WorkloadKind, namespace: &str) -> Result<Vec<Workload>> {
        match kind {
            WorkloadKind::Deployment => self.list_kind(kind, namespace, deployment_parts).await,
            WorkloadKind::StatefulSet => self.list_kind(kind, namespace, statefulset_parts).await,
            WorkloadKind::DaemonSet => self.list_kind(kind, namespace, daemonset_parts).await,
            WorkloadKind::ReplicaSet => self.list_kind(kind, namespace, replicaset_parts).await,
            WorkloadKind::ReplicationController => {
                self.list_kind(kind, namespace, replication_controller_parts)
                    .await
            }
        }
    }

    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Workload> {
        match kind {
            WorkloadKind::Deployment => self.get_kind(kind, namespace, name, deployment_parts).await,
            WorkloadKind::StatefulSet => self.get_kind(kind, namespace, name, statefulset_parts).await,
            WorkloadKind::DaemonSet => self.get_kind(kind, namespace, name, daemonset_parts).await,
            WorkloadKind::ReplicaSet => self.get_kind(kind, namespace, name, replicaset_parts).await,
            WorkloadKind::ReplicationController => {
                self.get_kind(kind, namespace, name, replication_controller_parts)
                    .await
            }
        }
    }

    async fn replace_workload_template(
        &self,
        workload: &Workload,
        template: PodTemplateSpec,
    ) -> Result<()> {
        match workload.kind {
            WorkloadKind::Deployment => self.patch_template::<Deployment>(workload, template).await,
            WorkloadKind::StatefulSet => self.patch_template::<StatefulSet>(workload, template).await,
            WorkloadKind::DaemonSet => self.patch_template::<DaemonSet>(workload, template).await,
            WorkloadKind::ReplicaSet => self.patch_template::<ReplicaSet>(workload, template).await,
            WorkloadKind::ReplicationController => {
                self.patch_template::<ReplicationController>(workload, template)
                    .await
            }
        }
    }

    async fn annotate_policy(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let patch = json!({
            "metadata": { "annotations": { key: value } }
        });
        self.api::<BackupPolicy>(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await
            .map_err(|e| Error::from_api(e, format!("BackupPolicy {}/{}", namespace, name)))?;
        Ok(())
    }
}
