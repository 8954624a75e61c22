//! Kubernetes Event recording

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

use super::EventRecorder;

/// Event recorder backed by `kube::runtime::events::Recorder`
pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    /// `controller_name` shows up as the reporting component of every event
    pub fn new(client: Client, controller_name: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller_name.to_string(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(
        &self,
        object_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        message: String,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object_ref.clone());
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message),
            action: actions::RECONCILE.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(reason, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`
pub mod reasons {
    pub const INVALID_BACKUP_POLICY: &str = "InvalidBackupPolicy";
    pub const INVALID_RECOVERY_REQUEST: &str = "InvalidRecoveryRequest";
    pub const SIDECAR_INJECTED: &str = "SidecarInjected";
    pub const SIDECAR_REMOVED: &str = "SidecarRemoved";
    pub const FAILED_TO_MUTATE: &str = "FailedToMutateWorkload";
    /// A workload is selected by more than one policy
    pub const MULTIPLE_POLICIES: &str = "MultiplePolicies";
    pub const JOB_CREATED: &str = "JobCreated";
    pub const FAILED_TO_RECOVER: &str = "FailedToRecover";
    pub const RECOVERY_SUCCEEDED: &str = "RecoverySucceeded";
    pub const FAILED_TO_DELETE: &str = "FailedToDelete";
}

/// Event actions
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
}
