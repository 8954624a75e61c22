//! Collaborators the reconcilers depend on, with Kubernetes implementations
//!
//! Reconcilers only see the traits defined here, so tests can run them
//! against in-memory fakes.

mod events;
mod job_watcher;
mod kube_api;
pub mod poll;
mod rbac;
mod rollout;
mod status;

pub use events::*;
pub use job_watcher::*;
pub use kube_api::*;
pub use rbac::*;
pub use rollout::*;
pub use status::*;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ObjectReference, Pod, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::runtime::events::EventType;

use crate::crd::{RecoveryPhase, WorkloadKind};
use crate::error::Result;

/// Field manager used for every write the operator makes
pub const FIELD_MANAGER: &str = "workload-backup-operator";

/// A workload whose pod template the operator may mutate
#[derive(Clone, Debug, PartialEq)]
pub struct Workload {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
    /// Version read; writes fail with a conflict if the object moved on
    pub resource_version: Option<String>,
    /// Selector of the pods the workload manages
    pub selector: Option<LabelSelector>,
    pub template: PodTemplateSpec,
}

impl Workload {
    /// Labels of the pod template, which policy selectors match against
    pub fn template_labels(&self) -> std::collections::BTreeMap<String, String> {
        self.template
            .metadata
            .as_ref()
            .and_then(|m| m.labels.clone())
            .unwrap_or_default()
    }

    /// ConfigMap the sidecars of this workload use as their lock
    pub fn lock_name(&self) -> String {
        format!("lock-{}-{}", self.kind.as_str(), self.name).to_lowercase()
    }

    /// Reference used to attach events to the workload
    pub fn object_ref(&self) -> ObjectReference {
        ObjectReference {
            api_version: Some(self.kind.api_version().to_string()),
            kind: Some(self.kind.as_str().to_string()),
            namespace: Some(self.namespace.clone()),
            name: Some(self.name.clone()),
            ..Default::default()
        }
    }
}

/// Object-level access to the API server.
///
/// Creates return [`crate::Error::AlreadyExists`] on a name collision and every
/// call returns [`crate::Error::NotFound`] for a missing object.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_job(&self, job: &Job) -> Result<Job>;

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Job>;

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_pods(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Pod>>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    async fn delete_pods(&self, namespace: &str, selector: &LabelSelector) -> Result<()>;

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_workloads(&self, kind: WorkloadKind, namespace: &str) -> Result<Vec<Workload>>;

    async fn get_workload(&self, kind: WorkloadKind, namespace: &str, name: &str)
        -> Result<Workload>;

    /// Replace the pod template, guarded by the workload's resource version
    async fn replace_workload_template(
        &self,
        workload: &Workload,
        template: PodTemplateSpec,
    ) -> Result<()>;

    /// Set one annotation on a BackupPolicy
    async fn annotate_policy(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()>;
}

/// Records cluster-visible events.
///
/// Fire-and-forget: failures are logged by the implementation and never
/// reach the caller.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(
        &self,
        object_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        message: String,
    );
}

/// Writes RecoveryRequest status
#[async_trait]
pub trait StatusWriter: Send + Sync {
    /// Set the phase. A request deleted in the meantime is not an error.
    async fn set_recovery_phase(
        &self,
        namespace: &str,
        name: &str,
        phase: RecoveryPhase,
    ) -> Result<()>;
}

/// Creates per-job access control objects
#[async_trait]
pub trait RbacEnsurer: Send + Sync {
    /// Ensure a ServiceAccount `name` exists and is bound to the recovery role
    async fn ensure_service_account_and_binding(&self, name: &str, namespace: &str)
        -> Result<()>;
}
