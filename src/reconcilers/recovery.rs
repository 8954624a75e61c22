//! RecoveryRequest reconciler
//!
//! Handles the business logic for recovery requests including:
//! - Spec validation
//! - BackupPolicy and workload resolution
//! - Recovery Job creation, at most once per request
//! - Handing the Job to a background watcher

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::policy;
use super::Reconciler;
use crate::adapters::{reasons, ClusterApi, EventRecorder, JobWatcher, RbacEnsurer, StatusWriter};
use crate::crd::{BackupPolicy, RecoveryPhase, RecoveryRequest, WorkloadKind};
use crate::error::{Error, Result};
use crate::feed::{split_key, Store, Watched};
use crate::metrics;
use crate::mutator::{
    local_volume, recovery_spec_equal, scratch_volume, SidecarImage, LOCAL_VOLUME_NAME,
    SCRATCH_MOUNT_PATH, SCRATCH_VOLUME_NAME, SIDECAR_CONTAINER_NAME,
};

/// Prefix of recovery Job names
pub const JOB_NAME_PREFIX: &str = "recovery-";

/// Validate the RecoveryRequest spec
pub fn validate(request: &RecoveryRequest) -> Result<()> {
    let spec = &request.spec;

    if spec.policy.is_empty() {
        return Err(Error::validation("BackupPolicy name must be specified"));
    }
    if spec.workload.name.is_empty() {
        return Err(Error::validation("Workload name must be specified"));
    }

    match spec.workload.workload_kind()? {
        WorkloadKind::StatefulSet if spec.pod_ordinal.as_deref().unwrap_or_default().is_empty() => {
            Err(Error::validation("podOrdinal is required for StatefulSet workloads"))
        }
        WorkloadKind::DaemonSet if spec.node_name.as_deref().unwrap_or_default().is_empty() => {
            Err(Error::validation("nodeName is required for DaemonSet workloads"))
        }
        _ => Ok(()),
    }
}

impl Watched for RecoveryRequest {
    const KIND: &'static str = "RecoveryRequest";
    const INVALID_REASON: &'static str = reasons::INVALID_RECOVERY_REQUEST;
    // Re-queuing would start a new Job for every Failed request
    const REQUEUE_ON_RESYNC: bool = false;

    fn validate(&self) -> Result<()> {
        validate(self)
    }

    fn spec_equal(&self, other: &Self) -> bool {
        recovery_spec_equal(&self.spec, &other.spec)
    }
}

/// Name of the Job that recovers `request`
pub fn job_name(request: &RecoveryRequest) -> String {
    format!("{}{}", JOB_NAME_PREFIX, request.name_any())
}

/// Build the recovery Job for a request from its policy
pub fn build_job(
    request: &RecoveryRequest,
    policy: &BackupPolicy,
    image: &SidecarImage,
    service_account: Option<&str>,
) -> Job {
    let name = job_name(request);
    let labels = BTreeMap::from([
        ("job-name".to_string(), name.clone()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            "workload-backup-operator".to_string(),
        ),
    ]);

    let mut volume_mounts = policy.spec.volume_mounts.clone();
    volume_mounts.push(VolumeMount {
        name: SCRATCH_VOLUME_NAME.to_string(),
        mount_path: SCRATCH_MOUNT_PATH.to_string(),
        ..Default::default()
    });

    let mut volumes = request.spec.volumes.clone();
    volumes.push(scratch_volume());

    if let (Some(local), Some(volume)) = (&policy.spec.backend.local, local_volume(&policy.spec.backend)) {
        volume_mounts.push(VolumeMount {
            name: LOCAL_VOLUME_NAME.to_string(),
            mount_path: local.path.clone(),
            ..Default::default()
        });
        volumes.push(volume);
    }

    let container = Container {
        name: SIDECAR_CONTAINER_NAME.to_string(),
        image: Some(image.reference(policy.sidecar_tag(&image.tag))),
        args: Some(vec![
            "recover".to_string(),
            format!("--recovery-name={}", request.name_any()),
            "--v=10".to_string(),
        ]),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: request.namespace(),
            labels: Some(labels.clone()),
            owner_references: request.controller_owner_ref(&()).map(|owner| vec![owner]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    restart_policy: Some("OnFailure".to_string()),
                    volumes: Some(volumes),
                    node_name: request.spec.node_name.clone(),
                    service_account_name: service_account.map(str::to_string),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Runs one recovery Job per RecoveryRequest
pub struct RecoveryReconciler {
    requests: Store<RecoveryRequest>,
    policies: Store<BackupPolicy>,
    api: Arc<dyn ClusterApi>,
    status: Arc<dyn StatusWriter>,
    events: Arc<dyn EventRecorder>,
    rbac: Option<Arc<dyn RbacEnsurer>>,
    image: SidecarImage,
    watcher: JobWatcher,
    /// `namespace/job` of every Job with a running watcher
    watching: Arc<Mutex<HashSet<String>>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl RecoveryReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        requests: Store<RecoveryRequest>,
        policies: Store<BackupPolicy>,
        api: Arc<dyn ClusterApi>,
        status: Arc<dyn StatusWriter>,
        events: Arc<dyn EventRecorder>,
        rbac: Option<Arc<dyn RbacEnsurer>>,
        image: SidecarImage,
        watcher: JobWatcher,
        tasks: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            requests,
            policies,
            api,
            status,
            events,
            rbac,
            image,
            watcher,
            watching: Arc::default(),
            tasks,
            shutdown,
        }
    }

    /// Look up the policy and check the workload still exists
    async fn resolve(&self, request: &RecoveryRequest, namespace: &str) -> Result<Arc<BackupPolicy>> {
        validate(request)?;

        let policy_key = format!("{}/{}", namespace, request.spec.policy);
        let policy = self.policies.get(&policy_key).ok_or_else(|| {
            Error::resolution(format!("BackupPolicy {} not found", policy_key))
        })?;
        policy::validate(&policy).map_err(|e| {
            Error::resolution(format!("BackupPolicy {} is invalid: {}", policy_key, e))
        })?;

        let kind = request.spec.workload.workload_kind()?;
        self.api
            .get_workload(kind, namespace, &request.spec.workload.name)
            .await?;

        Ok(policy)
    }

    /// Mark the request failed, tell the user, and hand the error back for retry
    async fn fail(&self, request: &RecoveryRequest, namespace: &str, err: Error) -> Result<()> {
        error!(name = %request.name_any(), error = %err, "Recovery failed");

        if let Err(e) = self
            .status
            .set_recovery_phase(namespace, &request.name_any(), RecoveryPhase::Failed)
            .await
        {
            warn!(name = %request.name_any(), error = %e, "Failed to set phase Failed");
        }

        let reason = match err {
            Error::Validation(_) => reasons::INVALID_RECOVERY_REQUEST,
            _ => reasons::FAILED_TO_RECOVER,
        };
        self.events
            .record(
                &request.object_ref(&()),
                EventType::Warning,
                reason,
                format!("Reason: {}", err),
            )
            .await;

        Err(err)
    }

    async fn mark_running(&self, request: &RecoveryRequest, namespace: &str, name: &str) -> Result<()> {
        match self
            .status
            .set_recovery_phase(namespace, name, RecoveryPhase::Running)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => self.fail(request, namespace, e).await,
        }
    }

    /// Start watching the Job unless a watcher already runs for it
    fn spawn_watcher(&self, request: &RecoveryRequest, namespace: &str, job_name: &str) {
        let key = format!("{}/{}", namespace, job_name);
        if !lock(&self.watching).insert(key.clone()) {
            debug!(job = %key, "Recovery job already watched");
            return;
        }

        let watcher = self.watcher.clone();
        let watching = self.watching.clone();
        let reference = request.object_ref(&());
        let job_name = job_name.to_string();
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            watcher.watch(&reference, &job_name, &shutdown).await;
            lock(&watching).remove(&key);
        });
    }

    /// Number of Jobs currently watched
    pub fn watched_jobs(&self) -> usize {
        lock(&self.watching).len()
    }
}

fn lock(set: &Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl Reconciler for RecoveryReconciler {
    async fn reconcile(&self, key: &str) -> Result<()> {
        let Some(request) = self.requests.get(key) else {
            debug!(key, "RecoveryRequest no longer exists");
            return Ok(());
        };

        let phase = request.phase();
        if matches!(phase, RecoveryPhase::Running | RecoveryPhase::Succeeded) {
            debug!(key, phase = %phase, "Recovery already started");
            return Ok(());
        }

        let namespace = split_key(key).0.unwrap_or("default");
        let name = request.name_any();
        info!(namespace, name = %name, "Reconciling RecoveryRequest");

        let policy = match self.resolve(&request, namespace).await {
            Ok(policy) => policy,
            Err(e) => return self.fail(&request, namespace, e).await,
        };

        let job_name = job_name(&request);
        let service_account = match &self.rbac {
            Some(rbac) => {
                if let Err(e) = rbac
                    .ensure_service_account_and_binding(&job_name, namespace)
                    .await
                {
                    return self.fail(&request, namespace, e).await;
                }
                Some(job_name.as_str())
            }
            None => None,
        };

        let job = build_job(&request, &policy, &self.image, service_account);

        match self.api.create_job(&job).await {
            Ok(_) => {
                info!(namespace, job = %job_name, "Recovery job created");
                metrics::RECOVERY_JOBS.with_label_values(&["created"]).inc();
                self.events
                    .record(
                        &request.object_ref(&()),
                        EventType::Normal,
                        reasons::JOB_CREATED,
                        format!("Recovery job created: {}", job_name),
                    )
                    .await;
                // The Job exists now, so it is watched even if the status write fails.
                self.spawn_watcher(&request, namespace, &job_name);
                self.mark_running(&request, namespace, &name).await
            }
            Err(e) if e.is_already_exists() => {
                debug!(namespace, job = %job_name, "Recovery job already exists");
                self.spawn_watcher(&request, namespace, &job_name);
                self.mark_running(&request, namespace, &name).await
            }
            Err(e) => self.fail(&request, namespace, e).await,
        }
    }
}
