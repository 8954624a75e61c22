//! RecoveryRequest status writes

use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use tracing::{debug, info};

use super::{StatusWriter, FIELD_MANAGER};
use crate::crd::{RecoveryPhase, RecoveryRequest};
use crate::error::{Error, Result};

/// Patches the status subresource through `kube::Client`
#[derive(Clone)]
pub struct KubeStatusWriter {
    client: Client,
}

impl KubeStatusWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn set_recovery_phase(
        &self,
        namespace: &str,
        name: &str,
        phase: RecoveryPhase,
    ) -> Result<()> {
        let api: Api<RecoveryRequest> = Api::namespaced(self.client.clone(), namespace);
        let status = match phase {
            RecoveryPhase::Running => json!({
                "status": { "phase": phase, "startTime": Utc::now() }
            }),
            RecoveryPhase::Succeeded | RecoveryPhase::Failed => json!({
                "status": { "phase": phase, "completionTime": Utc::now() }
            }),
            RecoveryPhase::Pending => json!({ "status": { "phase": phase } }),
        };

        match api
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(status))
            .await
            .map_err(|e| Error::from_api(e, format!("RecoveryRequest {}/{}", namespace, name)))
        {
            Ok(_) => {
                info!(namespace, name, phase = %phase, "Updated RecoveryRequest phase");
                Ok(())
            }
            Err(Error::NotFound(what)) => {
                debug!(what = %what, "RecoveryRequest gone before its phase could be set");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
