//! BackupPolicy Custom Resource Definition

use k8s_openapi::api::core::v1::{
    CSIVolumeSource, EmptyDirVolumeSource, EphemeralVolumeSource, HostPathVolumeSource,
    NFSVolumeSource, PersistentVolumeClaimVolumeSource, ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{LAST_APPLIED_ANNOTATION, SIDECAR_TAG_ANNOTATION};
use crate::error::Result;

/// BackupPolicy resource specification
#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "backup.oso.sh",
    version = "v1alpha1",
    kind = "BackupPolicy",
    plural = "backuppolicies",
    singular = "backuppolicy",
    shortname = "bp",
    namespaced,
    printcolumn = r#"{"name": "Schedule", "type": "string", "jsonPath": ".spec.schedule"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupPolicySpec {
    /// Selects the workloads (by pod template labels) that get the backup sidecar
    pub selector: LabelSelector,

    /// Groups of files to back up
    #[serde(default)]
    pub file_groups: Vec<FileGroup>,

    /// Where snapshots are stored
    pub backend: Backend,

    /// Cron schedule for backups
    pub schedule: String,

    /// Volumes exposed (read-only) to the backup sidecar
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,

    /// Compute resources for the sidecar container
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// A directory backed up together with its retention rules
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileGroup {
    /// Absolute path inside the sidecar
    pub path: String,

    /// Tags attached to every snapshot of this group
    #[serde(default)]
    pub tags: Vec<String>,

    /// Snapshot retention rules
    #[serde(default)]
    pub retention_policy: RetentionPolicy,
}

/// Snapshot retention rules for a file group
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_last: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_hourly: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_daily: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_weekly: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_monthly: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_yearly: Option<u32>,

    /// Snapshots carrying any of these tags are always kept
    #[serde(default)]
    pub keep_tags: Vec<String>,

    /// Remove unreferenced data after forgetting snapshots
    #[serde(default)]
    pub prune: bool,
}

/// Storage backend. Exactly one of the location fields must be set.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    /// Secret holding repository password and remote credentials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_secret_name: Option<String>,

    /// Local filesystem backend, mounted into the sidecar
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalBackend>,

    /// S3-compatible object storage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Backend>,

    /// Google Cloud Storage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gcs: Option<BucketBackend>,

    /// Azure Blob storage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureBackend>,

    /// Backblaze B2
    #[serde(skip_serializing_if = "Option::is_none")]
    pub b2: Option<BucketBackend>,
}

impl Backend {
    /// Names of the location fields that are set
    pub fn configured_locations(&self) -> Vec<&'static str> {
        let mut set = Vec::new();
        if self.local.is_some() {
            set.push("local");
        }
        if self.s3.is_some() {
            set.push("s3");
        }
        if self.gcs.is_some() {
            set.push("gcs");
        }
        if self.azure.is_some() {
            set.push("azure");
        }
        if self.b2.is_some() {
            set.push("b2");
        }
        set
    }

    /// True when the repository lives on a volume mounted into the pod
    pub fn is_local(&self) -> bool {
        self.local.is_some()
    }
}

/// Local filesystem backend
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalBackend {
    /// Mount path of the repository volume inside the sidecar
    pub path: String,

    /// Volume that holds the repository
    pub volume_source: VolumeSource,
}

/// Where the local repository volume comes from. Set exactly one field.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirVolumeSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_path: Option<HostPathVolumeSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PersistentVolumeClaimVolumeSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nfs: Option<NFSVolumeSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<EphemeralVolumeSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csi: Option<CSIVolumeSource>,
}

impl VolumeSource {
    /// Pod volume with this source under `name`
    pub fn to_volume(&self, name: &str) -> Volume {
        Volume {
            name: name.to_string(),
            empty_dir: self.empty_dir.clone(),
            host_path: self.host_path.clone(),
            persistent_volume_claim: self.persistent_volume_claim.clone(),
            nfs: self.nfs.clone(),
            ephemeral: self.ephemeral.clone(),
            csi: self.csi.clone(),
            ..Default::default()
        }
    }

    /// Number of source fields that are set
    pub fn configured(&self) -> usize {
        [
            self.empty_dir.is_some(),
            self.host_path.is_some(),
            self.persistent_volume_claim.is_some(),
            self.nfs.is_some(),
            self.ephemeral.is_some(),
            self.csi.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }
}

/// S3 backend
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct S3Backend {
    pub endpoint: String,
    pub bucket: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

/// Bucket based backend (GCS, B2)
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BucketBackend {
    pub bucket: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

/// Azure Blob backend
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AzureBackend {
    pub container: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

impl BackupPolicy {
    /// Sidecar image tag, honouring the per-policy override annotation
    pub fn sidecar_tag<'a>(&'a self, default_tag: &'a str) -> &'a str {
        self.annotations()
            .get(SIDECAR_TAG_ANNOTATION)
            .map(String::as_str)
            .filter(|tag| !tag.is_empty())
            .unwrap_or(default_tag)
    }

    /// Spec recorded the last time the controller applied this policy
    pub fn last_applied(&self) -> Result<Option<BackupPolicySpec>> {
        match self.annotations().get(LAST_APPLIED_ANNOTATION) {
            Some(data) if !data.is_empty() => Ok(Some(serde_json::from_str(data)?)),
            _ => Ok(None),
        }
    }
}
