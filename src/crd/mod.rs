//! Custom Resource Definitions for the Workload Backup Operator

mod backup_policy;
mod recovery_request;

pub use backup_policy::*;
pub use recovery_request::*;

use kube::CustomResourceExt;

/// Overrides the sidecar image tag for a single BackupPolicy
pub const SIDECAR_TAG_ANNOTATION: &str = "backup.oso.sh/sidecar-tag";

/// JSON of the BackupPolicy spec the controller last applied to workloads
pub const LAST_APPLIED_ANNOTATION: &str = "backup.oso.sh/last-applied-configuration";

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Result<Vec<String>, serde_yaml::Error> {
    Ok(vec![
        serde_yaml::to_string(&BackupPolicy::crd())?,
        serde_yaml::to_string(&RecoveryRequest::crd())?,
    ])
}
