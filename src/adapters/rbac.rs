//! Service accounts for recovery jobs

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::{Api, Client};
use tracing::info;

use super::RbacEnsurer;
use crate::error::{Error, Result};

/// Creates a ServiceAccount per recovery job and binds it to a ClusterRole
#[derive(Clone)]
pub struct KubeRbacEnsurer {
    client: Client,
    cluster_role: String,
}

impl KubeRbacEnsurer {
    pub fn new(client: Client, cluster_role: impl Into<String>) -> Self {
        Self {
            client,
            cluster_role: cluster_role.into(),
        }
    }
}

/// Treat a name collision as success
fn tolerate_existing<T>(result: Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_already_exists() => Ok(()),
        Err(e) => Err(e),
    }
}

pub fn role_binding(name: &str, namespace: &str, cluster_role: &str) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: cluster_role.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: name.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

#[async_trait]
impl RbacEnsurer for KubeRbacEnsurer {
    async fn ensure_service_account_and_binding(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<()> {
        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let account = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        tolerate_existing(
            accounts
                .create(&PostParams::default(), &account)
                .await
                .map_err(|e| Error::from_api(e, format!("ServiceAccount {}/{}", namespace, name))),
        )?;

        let bindings: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        tolerate_existing(
            bindings
                .create(
                    &PostParams::default(),
                    &role_binding(name, namespace, &self.cluster_role),
                )
                .await
                .map_err(|e| Error::from_api(e, format!("RoleBinding {}/{}", namespace, name))),
        )?;

        info!(name, namespace, role = %self.cluster_role, "Ensured recovery job RBAC");
        Ok(())
    }
}
