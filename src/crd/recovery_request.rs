//! RecoveryRequest Custom Resource Definition

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Volume;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// RecoveryRequest resource specification
#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "backup.oso.sh",
    version = "v1alpha1",
    kind = "RecoveryRequest",
    plural = "recoveryrequests",
    singular = "recoveryrequest",
    shortname = "rr",
    namespaced,
    status = "RecoveryRequestStatus",
    printcolumn = r#"{"name": "Policy", "type": "string", "jsonPath": ".spec.policy"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryRequestSpec {
    /// Name of the BackupPolicy (same namespace) whose backend holds the snapshots
    pub policy: String,

    /// Workload whose snapshots are recovered
    pub workload: WorkloadRef,

    /// Pod ordinal to recover, required for StatefulSets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_ordinal: Option<String>,

    /// Node the recovery job runs on, required for DaemonSets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Volumes the recovered data is written into
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

/// Kind and name of a workload in the request's namespace
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadRef {
    pub kind: String,
    pub name: String,
}

impl WorkloadRef {
    /// Parse the kind, rejecting anything the controller cannot mutate
    pub fn workload_kind(&self) -> Result<WorkloadKind> {
        self.kind.parse()
    }
}

/// RecoveryRequest status
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryRequestStatus {
    /// Current phase; absent means Pending
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<RecoveryPhase>,

    /// When the recovery Job was created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When the recovery Job finished
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
}

/// Lifecycle of a recovery request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum RecoveryPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RecoveryPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryPhase::Pending => "Pending",
            RecoveryPhase::Running => "Running",
            RecoveryPhase::Succeeded => "Succeeded",
            RecoveryPhase::Failed => "Failed",
        }
    }
}

impl fmt::Display for RecoveryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RecoveryRequest {
    /// Phase from status, Pending when unset
    pub fn phase(&self) -> RecoveryPhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or_default()
    }
}

/// Workload kinds whose pod templates can carry the backup sidecar
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
    ReplicaSet,
    ReplicationController,
}

impl WorkloadKind {
    pub const ALL: [WorkloadKind; 5] = [
        WorkloadKind::Deployment,
        WorkloadKind::StatefulSet,
        WorkloadKind::DaemonSet,
        WorkloadKind::ReplicaSet,
        WorkloadKind::ReplicationController,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::ReplicaSet => "ReplicaSet",
            WorkloadKind::ReplicationController => "ReplicationController",
        }
    }

    pub fn api_version(&self) -> &'static str {
        match self {
            WorkloadKind::ReplicationController => "v1",
            _ => "apps/v1",
        }
    }

    /// Kinds whose controllers do not replace running pods on template change
    pub fn needs_pod_restart(&self) -> bool {
        matches!(
            self,
            WorkloadKind::ReplicaSet | WorkloadKind::ReplicationController
        )
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadKind {
    type Err = Error;

    /// Accepts the kind, its plural, lowercase forms and the usual short names.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "deployment" | "deployments" | "deploy" => Ok(WorkloadKind::Deployment),
            "statefulset" | "statefulsets" | "sts" => Ok(WorkloadKind::StatefulSet),
            "daemonset" | "daemonsets" | "ds" => Ok(WorkloadKind::DaemonSet),
            "replicaset" | "replicasets" | "rs" => Ok(WorkloadKind::ReplicaSet),
            "replicationcontroller" | "replicationcontrollers" | "rc" => {
                Ok(WorkloadKind::ReplicationController)
            }
            other => Err(Error::validation(format!(
                "unrecognized workload kind '{}'",
                other
            ))),
        }
    }
}
