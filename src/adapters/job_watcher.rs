//! Recovery job completion watcher

use std::sync::{Arc, Mutex};

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::runtime::events::EventType;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::events::reasons;
use super::poll::poll_until;
use super::{ClusterApi, EventRecorder, StatusWriter};
use crate::config::PollSettings;
use crate::crd::RecoveryPhase;
use crate::error::{Error, Result};
use crate::metrics;

/// How a recovery job ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed,
}

/// Outcome of a job from its status, `None` while still running
pub fn job_outcome(job: &Job) -> Option<JobOutcome> {
    let status = job.status.as_ref()?;
    if status.succeeded.unwrap_or(0) > 0 {
        return Some(JobOutcome::Succeeded);
    }
    let failed = status
        .conditions
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|c| c.type_ == "Failed" && c.status == "True");
    failed.then_some(JobOutcome::Failed)
}

/// Polls a recovery job to completion, records the outcome on the request
/// and deletes the job with its pods.
#[derive(Clone)]
pub struct JobWatcher {
    api: Arc<dyn ClusterApi>,
    status: Arc<dyn StatusWriter>,
    events: Arc<dyn EventRecorder>,
    settings: PollSettings,
}

impl JobWatcher {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        status: Arc<dyn StatusWriter>,
        events: Arc<dyn EventRecorder>,
        settings: PollSettings,
    ) -> Self {
        Self {
            api,
            status,
            events,
            settings,
        }
    }

    /// Wait until the job finishes
    pub async fn wait(
        &self,
        namespace: &str,
        job_name: &str,
        shutdown: &CancellationToken,
    ) -> Result<JobOutcome> {
        let seen = Mutex::new(None);
        let slot = &seen;
        let what = format!("job {}/{} to complete", namespace, job_name);
        poll_until(&what, self.settings, shutdown, move || {
            let api = self.api.clone();
            async move {
                let job = api.get_job(namespace, job_name).await?;
                let outcome = job_outcome(&job);
                *slot.lock().unwrap_or_else(|e| e.into_inner()) = outcome;
                Ok(outcome.is_some())
            }
        })
        .await?;
        let outcome = *seen.lock().unwrap_or_else(|e| e.into_inner());
        outcome.ok_or(Error::Timeout(what))
    }

    /// Watch the job, then write the final phase and clean up.
    ///
    /// A timeout leaves the job in place; a cancelled watch does nothing.
    pub async fn watch(
        &self,
        request: &ObjectReference,
        job_name: &str,
        shutdown: &CancellationToken,
    ) {
        let namespace = request.namespace.as_deref().unwrap_or("default");
        let request_name = request.name.as_deref().unwrap_or_default();

        let outcome = match self.wait(namespace, job_name, shutdown).await {
            Ok(outcome) => outcome,
            Err(Error::Cancelled(_)) => {
                info!(namespace, job = job_name, "Stopped watching recovery job");
                return;
            }
            Err(e) => {
                warn!(namespace, job = job_name, error = %e, "Gave up watching recovery job");
                return;
            }
        };

        let (phase, label) = match outcome {
            JobOutcome::Succeeded => (RecoveryPhase::Succeeded, "succeeded"),
            JobOutcome::Failed => (RecoveryPhase::Failed, "failed"),
        };
        metrics::RECOVERY_JOBS.with_label_values(&[label]).inc();
        info!(namespace, job = job_name, outcome = label, "Recovery job finished");

        if let Err(e) = self
            .status
            .set_recovery_phase(namespace, request_name, phase)
            .await
        {
            error!(namespace, name = request_name, error = %e, "Failed to record recovery outcome");
        }
        match outcome {
            JobOutcome::Succeeded => {
                self.events
                    .record(
                        request,
                        EventType::Normal,
                        reasons::RECOVERY_SUCCEEDED,
                        format!("Recovery job {} succeeded", job_name),
                    )
                    .await;
            }
            JobOutcome::Failed => {
                self.events
                    .record(
                        request,
                        EventType::Warning,
                        reasons::FAILED_TO_RECOVER,
                        format!("Recovery job {} failed", job_name),
                    )
                    .await;
            }
        }

        self.cleanup(request, namespace, job_name).await;
    }

    /// Delete the job and the pods it created
    pub async fn cleanup(&self, request: &ObjectReference, namespace: &str, job_name: &str) {
        if let Err(e) = self.api.delete_job(namespace, job_name).await {
            if !e.is_not_found() {
                error!(namespace, job = job_name, error = %e, "Failed to delete recovery job");
                self.events
                    .record(
                        request,
                        EventType::Warning,
                        reasons::FAILED_TO_DELETE,
                        format!("Failed to delete Job. Reason: {}", e),
                    )
                    .await;
            }
        }

        let selector = LabelSelector {
            match_labels: Some([("job-name".to_string(), job_name.to_string())].into()),
            ..Default::default()
        };
        if let Err(e) = self.api.delete_pods(namespace, &selector).await {
            error!(namespace, job = job_name, error = %e, "Failed to delete recovery pods");
            self.events
                .record(
                    request,
                    EventType::Warning,
                    reasons::FAILED_TO_DELETE,
                    format!("Failed to delete Pods. Reason: {}", e),
                )
                .await;
        }
    }
}
