//! Controllers for the operator's CRDs
//!
//! Each kind runs its own pipeline: a change feed fills the kind's cache and
//! emits notifications, a dispatcher filters them into the kind's work queue
//! and workers hand queued keys to the kind's reconciler.

mod pipeline;
mod policy_controller;
mod recovery_controller;
pub mod worker;

pub use pipeline::spawn_pipeline;
pub use policy_controller::run as run_policy_controller;
pub use recovery_controller::run as run_recovery_controller;
pub use worker::{ErrorSink, LogErrorSink};

use std::sync::Arc;

use kube::Client;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::adapters::{
    ClusterApi, EventRecorder, JobWatcher, KubeClusterApi, KubeEventRecorder, KubeRbacEnsurer,
    KubeStatusWriter, RbacEnsurer, StatusWriter, FIELD_MANAGER,
};
use crate::config::OperatorConfig;
use crate::crd::{BackupPolicy, RecoveryRequest};
use crate::feed::{Store, Watched};
use crate::queue::{ExponentialBackoff, WorkQueue};
use crate::reconcilers::{PolicyReconciler, Reconciler, RecoveryReconciler};

/// Cache, queue and reconciler of one resource kind
pub struct KindController<K: Watched> {
    pub store: Store<K>,
    pub queue: WorkQueue,
    pub reconciler: Arc<dyn Reconciler>,
}

/// Collaborators the controllers are built from
pub struct Collaborators {
    pub api: Arc<dyn ClusterApi>,
    pub status: Arc<dyn StatusWriter>,
    pub events: Arc<dyn EventRecorder>,
    /// Set when recovery jobs get their own service account
    pub rbac: Option<Arc<dyn RbacEnsurer>>,
    pub errors: Arc<dyn ErrorSink>,
}

impl Collaborators {
    /// Kubernetes-backed collaborators
    pub fn from_client(client: Client, config: &OperatorConfig) -> Self {
        let rbac: Option<Arc<dyn RbacEnsurer>> = config.enable_rbac.then(|| {
            Arc::new(KubeRbacEnsurer::new(
                client.clone(),
                config.recovery_cluster_role.clone(),
            )) as Arc<dyn RbacEnsurer>
        });
        Self {
            api: Arc::new(KubeClusterApi::new(client.clone())),
            status: Arc::new(KubeStatusWriter::new(client.clone())),
            events: Arc::new(KubeEventRecorder::new(client, FIELD_MANAGER)),
            rbac,
            errors: Arc::new(LogErrorSink),
        }
    }
}

/// Shared context for all controllers
pub struct Context {
    pub config: OperatorConfig,
    pub policies: KindController<BackupPolicy>,
    pub recoveries: KindController<RecoveryRequest>,
    pub events: Arc<dyn EventRecorder>,
    pub errors: Arc<dyn ErrorSink>,
    /// Feeds, dispatchers, workers and background polls
    pub tasks: TaskTracker,
    pub shutdown: CancellationToken,
}

impl Context {
    /// Create a new context
    pub fn new(config: OperatorConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            api,
            status,
            events,
            rbac,
            errors,
        } = collaborators;
        let tasks = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let limiter = || ExponentialBackoff::new(config.queue_base_delay, config.queue_max_delay);
        let policy_queue = WorkQueue::new("backuppolicies", limiter());
        let recovery_queue = WorkQueue::new("recoveryrequests", limiter());

        let policy_store = Store::default();
        let recovery_store = Store::default();

        let policy_reconciler = PolicyReconciler::new(
            policy_store.clone(),
            api.clone(),
            events.clone(),
            config.sidecar_image.clone(),
            config.pod_poll,
            tasks.clone(),
            shutdown.clone(),
        );
        let recovery_reconciler = RecoveryReconciler::new(
            recovery_store.clone(),
            policy_store.clone(),
            api.clone(),
            status.clone(),
            events.clone(),
            rbac,
            config.sidecar_image.clone(),
            JobWatcher::new(api, status, events.clone(), config.job_poll),
            tasks.clone(),
            shutdown.clone(),
        );

        Self {
            policies: KindController {
                store: policy_store,
                queue: policy_queue,
                reconciler: Arc::new(policy_reconciler),
            },
            recoveries: KindController {
                store: recovery_store,
                queue: recovery_queue,
                reconciler: Arc::new(recovery_reconciler),
            },
            config,
            events,
            errors,
            tasks,
            shutdown,
        }
    }

    /// Cancel every task, let workers drain their queues and wait for all of them
    pub async fn stop(&self) {
        info!("Stopping controllers");
        self.shutdown.cancel();
        self.policies.queue.shut_down();
        self.recoveries.queue.shut_down();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Controllers stopped");
    }
}
