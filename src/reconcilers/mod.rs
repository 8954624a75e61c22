//! Reconcilers for the operator's CRDs
//!
//! Each reconciler receives a queue key, reads the current object from its
//! kind's cache and drives the cluster towards it:
//! - BackupPolicy: sidecar injection into, and removal from, matching workloads
//! - RecoveryRequest: one recovery Job per request, tracked to completion

pub mod policy;
pub mod recovery;

pub use policy::PolicyReconciler;
pub use recovery::RecoveryReconciler;

use async_trait::async_trait;

use crate::error::Result;

/// Per-key business logic. Retries are the caller's concern.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, key: &str) -> Result<()>;
}
