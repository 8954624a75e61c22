//! In-memory stand-ins for the cluster collaborators
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    Container, HostPathVolumeSource, ObjectReference, Pod, PodSpec, PodTemplateSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::runtime::events::EventType;
use kube::ResourceExt;

use workload_backup_operator::adapters::{
    ClusterApi, EventRecorder, RbacEnsurer, StatusWriter, Workload,
};
use workload_backup_operator::config::OperatorConfig;
use workload_backup_operator::controllers::{Collaborators, ErrorSink};
use workload_backup_operator::crd::{
    Backend, BackupPolicy, BackupPolicySpec, FileGroup, LocalBackend, RecoveryPhase,
    RecoveryRequest, RecoveryRequestSpec, RecoveryRequestStatus, RetentionPolicy, VolumeSource,
    WorkloadKind, WorkloadRef,
};
use workload_backup_operator::mutator::selector;
use workload_backup_operator::{Error, Result};

pub const NAMESPACE: &str = "apps";

#[derive(Clone, Debug)]
pub struct RecordedEvent {
    pub object: String,
    pub warning: bool,
    pub reason: String,
    pub message: String,
}

#[derive(Default)]
struct State {
    jobs: HashMap<String, Job>,
    workloads: Vec<Workload>,
    pods: Vec<Pod>,
    phases: HashMap<String, RecoveryPhase>,
    events: Vec<RecordedEvent>,
    annotations: HashMap<String, BTreeMap<String, String>>,
    replaced: Vec<String>,
    deleted_pods: Vec<String>,
    config_maps: HashSet<String>,
}

/// Fake API server. Every `ClusterApi` and `StatusWriter` call is counted.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
    api_calls: AtomicUsize,
    create_job_calls: AtomicUsize,
    rbac_calls: AtomicUsize,
    failing_status_writes: AtomicUsize,
    failing_rbac: AtomicBool,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn count(&self) {
        self.api_calls.fetch_add(1, Ordering::SeqCst);
    }

    pub fn api_calls(&self) -> usize {
        self.api_calls.load(Ordering::SeqCst)
    }

    pub fn create_job_calls(&self) -> usize {
        self.create_job_calls.load(Ordering::SeqCst)
    }

    pub fn rbac_calls(&self) -> usize {
        self.rbac_calls.load(Ordering::SeqCst)
    }

    pub fn add_workload(&self, workload: Workload) {
        self.state().workloads.push(workload);
    }

    pub fn add_pod(&self, pod: Pod) {
        self.state().pods.push(pod);
    }

    /// Change a stored workload in place, as another writer would
    pub fn edit_workload(&self, kind: WorkloadKind, name: &str, edit: impl FnOnce(&mut Workload)) {
        let mut state = self.state();
        let stored = state
            .workloads
            .iter_mut()
            .find(|w| w.kind == kind && w.name == name)
            .unwrap();
        edit(stored);
    }

    pub fn add_config_map(&self, name: &str) {
        self.state()
            .config_maps
            .insert(format!("{}/{}", NAMESPACE, name));
    }

    pub fn config_maps(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state().config_maps.iter().cloned().collect();
        names.sort();
        names
    }

    /// Make the next `n` status writes fail
    pub fn fail_next_status_writes(&self, n: usize) {
        self.failing_status_writes.store(n, Ordering::SeqCst);
    }

    /// Make every RBAC ensure fail
    pub fn fail_rbac(&self) {
        self.failing_rbac.store(true, Ordering::SeqCst);
    }

    pub fn workload(&self, kind: WorkloadKind, name: &str) -> Option<Workload> {
        self.state()
            .workloads
            .iter()
            .find(|w| w.kind == kind && w.name == name)
            .cloned()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.state().jobs.values().cloned().collect()
    }

    /// Overwrite the status of a stored job
    pub fn set_job(&self, job: Job) {
        let key = format!("{}/{}", job.namespace().unwrap_or_default(), job.name_any());
        self.state().jobs.insert(key, job);
    }

    pub fn phase(&self, name: &str) -> Option<RecoveryPhase> {
        self.state()
            .phases
            .get(&format!("{}/{}", NAMESPACE, name))
            .copied()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.state().events.clone()
    }

    pub fn events_with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.reason == reason)
            .collect()
    }

    pub fn policy_annotation(&self, name: &str, key: &str) -> Option<String> {
        self.state()
            .annotations
            .get(&format!("{}/{}", NAMESPACE, name))
            .and_then(|a| a.get(key).cloned())
    }

    /// Names of workloads whose template was replaced, in order
    pub fn replaced(&self) -> Vec<String> {
        self.state().replaced.clone()
    }

    pub fn deleted_pods(&self) -> Vec<String> {
        self.state().deleted_pods.clone()
    }

    pub fn collaborators(self: &Arc<Self>, rbac: bool, errors: Arc<dyn ErrorSink>) -> Collaborators {
        Collaborators {
            api: self.clone(),
            status: self.clone(),
            events: self.clone(),
            rbac: rbac.then(|| self.clone() as Arc<dyn RbacEnsurer>),
            errors,
        }
    }
}

fn not_found(what: &str) -> Error {
    Error::NotFound(what.to_string())
}

fn api_error(code: u16, reason: &str, message: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: reason.to_string(),
        code,
    }))
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn create_job(&self, job: &Job) -> Result<Job> {
        self.count();
        self.create_job_calls.fetch_add(1, Ordering::SeqCst);
        let key = format!("{}/{}", job.namespace().unwrap_or_default(), job.name_any());
        let mut state = self.state();
        if state.jobs.contains_key(&key) {
            return Err(Error::AlreadyExists(key));
        }
        state.jobs.insert(key, job.clone());
        Ok(job.clone())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Job> {
        self.count();
        let key = format!("{}/{}", namespace, name);
        self.state().jobs.get(&key).cloned().ok_or_else(|| not_found(&key))
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        self.count();
        let key = format!("{}/{}", namespace, name);
        self.state()
            .jobs
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| not_found(&key))
    }

    async fn list_pods(&self, namespace: &str, sel: &LabelSelector) -> Result<Vec<Pod>> {
        self.count();
        let pods = self.state().pods.clone();
        let mut out = Vec::new();
        for pod in pods {
            if pod.namespace().as_deref() == Some(namespace)
                && selector::matches(sel, pod.labels())?
            {
                out.push(pod);
            }
        }
        Ok(out)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.count();
        let mut state = self.state();
        let before = state.pods.len();
        state
            .pods
            .retain(|p| !(p.namespace().as_deref() == Some(namespace) && p.name_any() == name));
        if state.pods.len() == before {
            return Err(not_found(name));
        }
        state.deleted_pods.push(name.to_string());
        Ok(())
    }

    async fn delete_pods(&self, namespace: &str, sel: &LabelSelector) -> Result<()> {
        for pod in self.list_pods(namespace, sel).await? {
            self.delete_pod(namespace, &pod.name_any()).await?;
        }
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        self.count();
        let key = format!("{}/{}", namespace, name);
        if self.state().config_maps.remove(&key) {
            Ok(())
        } else {
            Err(not_found(&key))
        }
    }

    async fn list_workloads(&self, kind: WorkloadKind, namespace: &str) -> Result<Vec<Workload>> {
        self.count();
        Ok(self
            .state()
            .workloads
            .iter()
            .filter(|w| w.kind == kind && w.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn get_workload(&self, kind: WorkloadKind, namespace: &str, name: &str) -> Result<Workload> {
        self.count();
        self.state()
            .workloads
            .iter()
            .find(|w| w.kind == kind && w.namespace == namespace && w.name == name)
            .cloned()
            .ok_or_else(|| not_found(name))
    }

    async fn replace_workload_template(
        &self,
        workload: &Workload,
        template: PodTemplateSpec,
    ) -> Result<()> {
        self.count();
        let mut state = self.state();
        let stored = state
            .workloads
            .iter_mut()
            .find(|w| w.kind == workload.kind && w.namespace == workload.namespace && w.name == workload.name)
            .ok_or_else(|| not_found(&workload.name))?;
        stored.template = template;
        state.replaced.push(workload.name.clone());
        Ok(())
    }

    async fn annotate_policy(&self, namespace: &str, name: &str, key: &str, value: &str) -> Result<()> {
        self.count();
        self.state()
            .annotations
            .entry(format!("{}/{}", namespace, name))
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[async_trait]
impl StatusWriter for FakeCluster {
    async fn set_recovery_phase(&self, namespace: &str, name: &str, phase: RecoveryPhase) -> Result<()> {
        self.count();
        let failing = self
            .failing_status_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(api_error(409, "Conflict", &format!("status of {}/{}", namespace, name)));
        }
        self.state()
            .phases
            .insert(format!("{}/{}", namespace, name), phase);
        Ok(())
    }
}

#[async_trait]
impl EventRecorder for FakeCluster {
    async fn record(&self, object_ref: &ObjectReference, type_: EventType, reason: &str, message: String) {
        self.state().events.push(RecordedEvent {
            object: object_ref.name.clone().unwrap_or_default(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            message,
        });
    }
}

#[async_trait]
impl RbacEnsurer for FakeCluster {
    async fn ensure_service_account_and_binding(&self, _name: &str, _namespace: &str) -> Result<()> {
        self.rbac_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_rbac.load(Ordering::SeqCst) {
            return Err(api_error(403, "Forbidden", "cannot create serviceaccounts"));
        }
        Ok(())
    }
}

/// Error sink that remembers every report
#[derive(Default)]
pub struct RecordingSink {
    reports: Mutex<Vec<(String, String, String)>>,
}

impl RecordingSink {
    pub fn reports(&self) -> Vec<(String, String, String)> {
        self.reports.lock().unwrap().clone()
    }
}

impl ErrorSink for RecordingSink {
    fn report(&self, kind: &str, key: &str, err: &Error) {
        self.reports
            .lock()
            .unwrap()
            .push((kind.to_string(), key.to_string(), err.to_string()));
    }
}

// ============================================================================
// Object builders
// ============================================================================

pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn selector_for(pairs: &[(&str, &str)]) -> LabelSelector {
    LabelSelector {
        match_labels: Some(labels(pairs)),
        ..Default::default()
    }
}

pub fn local_backend(path: &str) -> Backend {
    Backend {
        storage_secret_name: Some("repo-secret".to_string()),
        local: Some(LocalBackend {
            path: path.to_string(),
            volume_source: VolumeSource {
                host_path: Some(HostPathVolumeSource {
                    path: "/data/backups".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        }),
        ..Default::default()
    }
}

pub fn policy_spec(sel: &[(&str, &str)]) -> BackupPolicySpec {
    BackupPolicySpec {
        selector: selector_for(sel),
        file_groups: vec![FileGroup {
            path: "/var/lib/app".to_string(),
            tags: vec!["app".to_string()],
            retention_policy: RetentionPolicy {
                keep_last: Some(5),
                prune: true,
                ..Default::default()
            },
        }],
        backend: local_backend("/repo"),
        schedule: "*/15 * * * *".to_string(),
        volume_mounts: vec![],
        resources: None,
    }
}

pub fn policy(name: &str, spec: BackupPolicySpec) -> BackupPolicy {
    let mut p = BackupPolicy::new(name, spec);
    p.metadata.namespace = Some(NAMESPACE.to_string());
    p.metadata.uid = Some(format!("uid-{}", name));
    p
}

pub fn request(name: &str, policy: &str, workload: &str) -> RecoveryRequest {
    let mut rec = RecoveryRequest::new(
        name,
        RecoveryRequestSpec {
            policy: policy.to_string(),
            workload: WorkloadRef {
                kind: "Deployment".to_string(),
                name: workload.to_string(),
            },
            pod_ordinal: None,
            node_name: Some("node-1".to_string()),
            volumes: vec![],
        },
    );
    rec.metadata.namespace = Some(NAMESPACE.to_string());
    rec.metadata.uid = Some(format!("uid-{}", name));
    rec
}

pub fn with_phase(mut rec: RecoveryRequest, phase: RecoveryPhase) -> RecoveryRequest {
    rec.status = Some(RecoveryRequestStatus {
        phase: Some(phase),
        ..Default::default()
    });
    rec
}

pub fn app_container() -> Container {
    Container {
        name: "app".to_string(),
        image: Some("nginx:1.27".to_string()),
        ..Default::default()
    }
}

pub fn workload(kind: WorkloadKind, name: &str, pod_labels: &[(&str, &str)]) -> Workload {
    Workload {
        kind,
        namespace: NAMESPACE.to_string(),
        name: name.to_string(),
        resource_version: Some("1".to_string()),
        selector: Some(selector_for(pod_labels)),
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels(pod_labels)),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![app_container()],
                ..Default::default()
            }),
        },
    }
}

pub fn pod(name: &str, pod_labels: &[(&str, &str)], containers: Vec<Container>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(labels(pod_labels)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers,
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn config() -> OperatorConfig {
    OperatorConfig::default()
}
