//! Pod restarts for workloads that do not roll out template changes
//!
//! ReplicaSets and ReplicationControllers keep running pods built from the old
//! template. Deleting those pods lets the controller recreate them from the
//! mutated one.

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::poll::poll_until;
use super::ClusterApi;
use crate::config::PollSettings;
use crate::error::Result;
use crate::mutator::has_sidecar;

/// Delete selected pods until every one of them has (or lacks) the sidecar
pub async fn restart_pods_until(
    api: Arc<dyn ClusterApi>,
    namespace: &str,
    selector: &LabelSelector,
    want_sidecar: bool,
    settings: PollSettings,
    shutdown: &CancellationToken,
) -> Result<()> {
    let what = format!(
        "pods in {} to {} the backup sidecar",
        namespace,
        if want_sidecar { "gain" } else { "lose" }
    );

    poll_until(&what, settings, shutdown, || {
        let api = api.clone();
        async move {
            let pods = api.list_pods(namespace, selector).await?;
            let stale: Vec<String> = pods
                .iter()
                .filter(|pod| {
                    let present = pod
                        .spec
                        .as_ref()
                        .is_some_and(|spec| has_sidecar(&spec.containers));
                    present != want_sidecar
                })
                .map(|pod| pod.name_any())
                .collect();

            if stale.is_empty() {
                return Ok(true);
            }
            for name in &stale {
                if let Err(e) = api.delete_pod(namespace, name).await {
                    if !e.is_not_found() {
                        warn!(namespace, pod = %name, error = %e, "Failed to delete pod");
                    }
                }
            }
            info!(namespace, restarted = stale.len(), "Restarted pods to apply sidecar change");
            Ok(false)
        }
    })
    .await
}
