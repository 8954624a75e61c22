//! Backup sidecar container

use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, ObjectFieldSelector, VolumeMount,
};

use super::{LOCAL_VOLUME_NAME, PODINFO_VOLUME_NAME, SCRATCH_VOLUME_NAME, SIDECAR_CONTAINER_NAME};
use crate::crd::{BackupPolicy, WorkloadKind};

/// Prefix of the sidecar argument naming the owning policy
pub const POLICY_NAME_ARG: &str = "--policy-name=";

/// Pre-release tag channel: verbose logging and always-pull
pub const CANARY_TAG: &str = "canary";

pub const SCRATCH_MOUNT_PATH: &str = "/tmp";
pub const PODINFO_MOUNT_PATH: &str = "/etc/backup";

/// Image repository and default tag for operator-managed containers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SidecarImage {
    pub repository: String,
    pub tag: String,
}

impl SidecarImage {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    pub fn reference(&self, tag: &str) -> String {
        format!("{}:{}", self.repository, tag)
    }
}

/// Build the sidecar container for a workload governed by `policy`
pub fn sidecar_container(
    policy: &BackupPolicy,
    kind: WorkloadKind,
    workload_name: &str,
    image: &SidecarImage,
) -> Container {
    let tag = policy.sidecar_tag(&image.tag);
    let policy_name = policy.metadata.name.as_deref().unwrap_or_default();

    let mut args = vec![
        "schedule".to_string(),
        format!("{}{}", POLICY_NAME_ARG, policy_name),
        format!("--workload-kind={}", kind),
        format!("--workload-name={}", workload_name),
    ];
    let pull_policy = if tag == CANARY_TAG {
        args.push("--v=5".to_string());
        "Always"
    } else {
        args.push("--v=3".to_string());
        "IfNotPresent"
    };

    let mut volume_mounts = vec![
        VolumeMount {
            name: SCRATCH_VOLUME_NAME.to_string(),
            mount_path: SCRATCH_MOUNT_PATH.to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: PODINFO_VOLUME_NAME.to_string(),
            mount_path: PODINFO_MOUNT_PATH.to_string(),
            ..Default::default()
        },
    ];
    volume_mounts.extend(policy.spec.volume_mounts.iter().map(|m| VolumeMount {
        name: m.name.clone(),
        mount_path: m.mount_path.clone(),
        sub_path: m.sub_path.clone(),
        read_only: Some(true),
        ..Default::default()
    }));
    if let Some(local) = &policy.spec.backend.local {
        volume_mounts.push(VolumeMount {
            name: LOCAL_VOLUME_NAME.to_string(),
            mount_path: local.path.clone(),
            ..Default::default()
        });
    }

    Container {
        name: SIDECAR_CONTAINER_NAME.to_string(),
        image: Some(image.reference(tag)),
        image_pull_policy: Some(pull_policy.to_string()),
        args: Some(args),
        env: Some(vec![
            field_env("NODE_NAME", "spec.nodeName"),
            field_env("POD_NAME", "metadata.name"),
        ]),
        resources: policy.spec.resources.clone(),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Policy named in a sidecar container's arguments
pub fn policy_of(container: &Container) -> Option<&str> {
    container
        .args
        .as_deref()?
        .iter()
        .find_map(|arg| arg.strip_prefix(POLICY_NAME_ARG))
}
