//! BackupPolicy reconciler
//!
//! Handles the business logic for backup policies including:
//! - Spec validation
//! - Sidecar injection into workloads matched by the policy selector
//! - Sidecar removal from workloads the policy no longer matches
//! - Pod restarts for workloads that do not roll out template changes

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use cron::Schedule;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::Reconciler;
use crate::adapters::{reasons, restart_pods_until, ClusterApi, EventRecorder, Workload};
use crate::config::PollSettings;
use crate::crd::{BackupPolicy, BackupPolicySpec, WorkloadKind, LAST_APPLIED_ANNOTATION};
use crate::error::{Error, Result};
use crate::feed::{split_key, Store, Watched};
use crate::metrics;
use crate::mutator::{
    inject_sidecar, injected_policy, policy_spec_equal, remove_sidecar, selector, template_equal,
    SidecarImage,
};

/// Validate the BackupPolicy spec
pub fn validate(policy: &BackupPolicy) -> Result<()> {
    let spec = &policy.spec;

    selector::validate(&spec.selector)?;

    validate_schedule(&spec.schedule)?;

    if spec.file_groups.is_empty() {
        return Err(Error::validation("At least one file group must be specified"));
    }
    for group in &spec.file_groups {
        if !group.path.starts_with('/') {
            return Err(Error::validation(format!(
                "File group path '{}' must be absolute",
                group.path
            )));
        }
    }

    validate_backend(spec)?;

    for mount in &spec.volume_mounts {
        if mount.name.is_empty() || mount.mount_path.is_empty() {
            return Err(Error::validation("Volume mounts need a name and a mount path"));
        }
    }

    Ok(())
}

/// Validate a cron schedule.
///
/// Standard 5-field expressions are accepted alongside the 6/7-field forms
/// with seconds and the `@hourly` style shorthands.
pub fn validate_schedule(schedule: &str) -> Result<()> {
    let schedule = schedule.trim();
    if schedule.is_empty() {
        return Err(Error::validation("Schedule must be specified"));
    }

    let expression = if !schedule.starts_with('@') && schedule.split_whitespace().count() == 5 {
        format!("0 {}", schedule)
    } else {
        schedule.to_string()
    };

    Schedule::from_str(&expression)
        .map(|_| ())
        .map_err(|e| Error::validation(format!("Invalid cron schedule '{}': {}", schedule, e)))
}

fn validate_backend(spec: &BackupPolicySpec) -> Result<()> {
    let backend = &spec.backend;
    let locations = backend.configured_locations();
    match locations.len() {
        0 => {
            return Err(Error::validation(
                "Backend must specify one of: local, s3, gcs, azure, b2",
            ))
        }
        1 => {}
        _ => {
            return Err(Error::validation(format!(
                "Backend must specify exactly one location, found: {}",
                locations.join(", ")
            )))
        }
    }

    if let Some(local) = &backend.local {
        if !local.path.starts_with('/') {
            return Err(Error::validation(format!(
                "Local backend path '{}' must be absolute",
                local.path
            )));
        }
        if local.volume_source.configured() != 1 {
            return Err(Error::validation(
                "Local backend needs exactly one volume source",
            ));
        }
    }
    if let Some(s3) = &backend.s3 {
        if s3.bucket.is_empty() {
            return Err(Error::validation("S3 backend requires a bucket"));
        }
    }
    for bucket in [&backend.gcs, &backend.b2].into_iter().flatten() {
        if bucket.bucket.is_empty() {
            return Err(Error::validation("Bucket backends require a bucket"));
        }
    }
    if let Some(azure) = &backend.azure {
        if azure.container.is_empty() {
            return Err(Error::validation("Azure backend requires a container"));
        }
    }

    if backend.storage_secret_name.as_deref().unwrap_or_default().is_empty() {
        return Err(Error::validation("Backend storageSecretName must be specified"));
    }

    Ok(())
}

impl Watched for BackupPolicy {
    const KIND: &'static str = "BackupPolicy";
    const INVALID_REASON: &'static str = reasons::INVALID_BACKUP_POLICY;

    fn validate(&self) -> Result<()> {
        validate(self)
    }

    fn spec_equal(&self, other: &Self) -> bool {
        policy_spec_equal(&self.spec, &other.spec)
    }
}

/// Keeps the sidecar of every workload in line with the policies that select it
pub struct PolicyReconciler {
    policies: Store<BackupPolicy>,
    api: Arc<dyn ClusterApi>,
    events: Arc<dyn EventRecorder>,
    image: SidecarImage,
    pod_poll: PollSettings,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl PolicyReconciler {
    pub fn new(
        policies: Store<BackupPolicy>,
        api: Arc<dyn ClusterApi>,
        events: Arc<dyn EventRecorder>,
        image: SidecarImage,
        pod_poll: PollSettings,
        tasks: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            policies,
            api,
            events,
            image,
            pod_poll,
            tasks,
            shutdown,
        }
    }

    /// Bring every workload in the policy's namespace in line with it
    async fn apply(&self, policy: &BackupPolicy, namespace: &str) -> Result<()> {
        if let Err(e) = validate(policy) {
            warn!(name = %policy.name_any(), error = %e, "Validation failed");
            self.events
                .record(
                    &policy.object_ref(&()),
                    EventType::Warning,
                    reasons::INVALID_BACKUP_POLICY,
                    format!("Reason: {}", e),
                )
                .await;
            return Err(e);
        }

        let old = match policy.last_applied() {
            Ok(old) => old,
            Err(e) => {
                warn!(name = %policy.name_any(), error = %e, "Ignoring unreadable last-applied configuration");
                None
            }
        };

        let mut first_error = None;
        for kind in WorkloadKind::ALL {
            for workload in self.api.list_workloads(kind, namespace).await? {
                if let Err(e) = self.sync_workload(policy, old.as_ref(), &workload).await {
                    error!(
                        kind = %workload.kind,
                        workload = %workload.name,
                        error = %e,
                        "Failed to sync workload"
                    );
                    self.events
                        .record(
                            &workload.object_ref(),
                            EventType::Warning,
                            reasons::FAILED_TO_MUTATE,
                            format!("Reason: {}", e),
                        )
                        .await;
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        self.record_last_applied(policy, old.as_ref(), namespace).await
    }

    async fn sync_workload(
        &self,
        policy: &BackupPolicy,
        old: Option<&BackupPolicySpec>,
        workload: &Workload,
    ) -> Result<()> {
        let name = policy.name_any();
        let labels = workload.template_labels();

        if selector::matches(&policy.spec.selector, &labels)? {
            if let Some(other) = self.other_matching_policy(&name, &workload.namespace, &labels) {
                warn!(
                    kind = %workload.kind,
                    workload = %workload.name,
                    policy = %name,
                    other = %other,
                    "Workload matches multiple policies, skipping"
                );
                self.events
                    .record(
                        &workload.object_ref(),
                        EventType::Warning,
                        reasons::MULTIPLE_POLICIES,
                        format!("Workload matches BackupPolicies {} and {}", name, other),
                    )
                    .await;
                return Ok(());
            }

            let desired = inject_sidecar(
                &workload.template,
                policy,
                old,
                workload.kind,
                &workload.name,
                &self.image,
            );
            if template_equal(&desired, &workload.template) {
                debug!(kind = %workload.kind, workload = %workload.name, "Sidecar up to date");
                return Ok(());
            }

            self.api.replace_workload_template(workload, desired).await?;
            metrics::SIDECAR_MUTATIONS
                .with_label_values(&["inject", workload.kind.as_str()])
                .inc();
            info!(kind = %workload.kind, workload = %workload.name, policy = %name, "Injected backup sidecar");
            self.events
                .record(
                    &workload.object_ref(),
                    EventType::Normal,
                    reasons::SIDECAR_INJECTED,
                    format!("Backup sidecar added for BackupPolicy {}", name),
                )
                .await;
            self.restart_pods(workload, true);
        } else if injected_policy(&workload.template) == Some(name.as_str()) {
            self.release_workload(workload, &name).await?;
        }

        Ok(())
    }

    /// Another valid cached policy in the namespace that also selects `labels`
    fn other_matching_policy(
        &self,
        name: &str,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Option<String> {
        self.policies
            .list_namespace(namespace)
            .into_iter()
            .filter(|other| other.name_any() != name)
            .filter(|other| validate(other).is_ok())
            .find(|other| selector::matches(&other.spec.selector, labels).unwrap_or(false))
            .map(|other| other.name_any())
    }

    async fn release_workload(&self, workload: &Workload, policy_name: &str) -> Result<()> {
        // Deleted before the template so a retry still finds the sidecar
        let lock = workload.lock_name();
        match self.api.delete_config_map(&workload.namespace, &lock).await {
            Ok(()) => debug!(workload = %workload.name, lock = %lock, "Deleted sidecar lock"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let desired = remove_sidecar(&workload.template);
        self.api.replace_workload_template(workload, desired).await?;
        metrics::SIDECAR_MUTATIONS
            .with_label_values(&["remove", workload.kind.as_str()])
            .inc();
        info!(kind = %workload.kind, workload = %workload.name, policy = %policy_name, "Removed backup sidecar");
        self.events
            .record(
                &workload.object_ref(),
                EventType::Normal,
                reasons::SIDECAR_REMOVED,
                format!("Backup sidecar removed for BackupPolicy {}", policy_name),
            )
            .await;
        self.restart_pods(workload, false);
        Ok(())
    }

    /// Remove the sidecar of a deleted policy from every workload carrying it
    async fn release(&self, namespace: &str, name: &str) -> Result<()> {
        info!(namespace, name, "BackupPolicy deleted, removing its sidecars");

        let mut first_error = None;
        for kind in WorkloadKind::ALL {
            for workload in self.api.list_workloads(kind, namespace).await? {
                if injected_policy(&workload.template) != Some(name) {
                    continue;
                }
                if let Err(e) = self.release_workload(&workload, name).await {
                    error!(kind = %workload.kind, workload = %workload.name, error = %e, "Failed to remove sidecar");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn record_last_applied(
        &self,
        policy: &BackupPolicy,
        old: Option<&BackupPolicySpec>,
        namespace: &str,
    ) -> Result<()> {
        if old.is_some_and(|old| old == &policy.spec) {
            return Ok(());
        }
        let data = serde_json::to_string(&policy.spec)?;
        self.api
            .annotate_policy(namespace, &policy.name_any(), LAST_APPLIED_ANNOTATION, &data)
            .await
    }

    /// Restart pods in the background for kinds that keep their old pods
    fn restart_pods(&self, workload: &Workload, want_sidecar: bool) {
        if !workload.kind.needs_pod_restart() {
            return;
        }

        let selector = workload.selector.clone().unwrap_or_else(|| LabelSelector {
            match_labels: Some(workload.template_labels()),
            ..Default::default()
        });
        let api = self.api.clone();
        let settings = self.pod_poll;
        let shutdown = self.shutdown.clone();
        let namespace = workload.namespace.clone();
        let name = workload.name.clone();

        self.tasks.spawn(async move {
            match restart_pods_until(api, &namespace, &selector, want_sidecar, settings, &shutdown)
                .await
            {
                Ok(()) => info!(namespace = %namespace, workload = %name, "Pods converged"),
                Err(Error::Cancelled(_)) => {}
                Err(e) => warn!(namespace = %namespace, workload = %name, error = %e, "Pods did not converge"),
            }
        });
    }
}

#[async_trait]
impl Reconciler for PolicyReconciler {
    async fn reconcile(&self, key: &str) -> Result<()> {
        let (namespace, name) = split_key(key);
        let namespace = namespace.unwrap_or("default");

        match self.policies.get(key) {
            Some(policy) => self.apply(&policy, namespace).await,
            None => self.release(namespace, name).await,
        }
    }
}
