//! Sidecar and volume mutation of workload pod templates
//!
//! The controller owns one container and three well-known volumes in any pod
//! template it touches. Everything here is pure: functions take the current
//! template and return the desired one, leaving the input untouched.

pub mod quantity;
pub mod selector;
mod sidecar;
mod volumes;

pub use sidecar::*;
pub use volumes::*;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, PodTemplateSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::crd::{BackupPolicy, BackupPolicySpec, RecoveryRequestSpec, WorkloadKind};

/// Name of the injected backup container
pub const SIDECAR_CONTAINER_NAME: &str = "backup-agent";
/// Backend repository volume (local backends only)
pub const LOCAL_VOLUME_NAME: &str = "backup-local";
/// Scratch space for the sidecar
pub const SCRATCH_VOLUME_NAME: &str = "backup-scratchdir";
/// Downward API volume with pod metadata
pub const PODINFO_VOLUME_NAME: &str = "backup-podinfo";

/// Return `template` with the sidecar and its volumes merged in.
///
/// `old` is the last-applied policy spec, used to decide what happens to the
/// backend volume when the backend kind changed.
pub fn inject_sidecar(
    template: &PodTemplateSpec,
    policy: &BackupPolicy,
    old: Option<&BackupPolicySpec>,
    kind: WorkloadKind,
    workload_name: &str,
    image: &SidecarImage,
) -> PodTemplateSpec {
    let mut desired = template.clone();
    let spec = desired.spec.get_or_insert_with(Default::default);

    upsert_container(
        &mut spec.containers,
        sidecar_container(policy, kind, workload_name, image),
    );

    let mut volumes = spec.volumes.take().unwrap_or_default();
    upsert_scratch_volume(&mut volumes);
    upsert_downward_volume(&mut volumes);
    merge_local_volume(&mut volumes, old.map(|o| &o.backend), &policy.spec.backend);
    spec.volumes = Some(volumes);

    desired
}

/// Return `template` without the sidecar and the well-known volumes
pub fn remove_sidecar(template: &PodTemplateSpec) -> PodTemplateSpec {
    let mut desired = template.clone();
    if let Some(spec) = desired.spec.as_mut() {
        spec.containers.retain(|c| c.name != SIDECAR_CONTAINER_NAME);
        if let Some(volumes) = spec.volumes.as_mut() {
            for name in [SCRATCH_VOLUME_NAME, PODINFO_VOLUME_NAME, LOCAL_VOLUME_NAME] {
                remove_volume(volumes, name);
            }
            if volumes.is_empty() {
                spec.volumes = None;
            }
        }
    }
    desired
}

/// Name of the policy whose sidecar is present in the template
pub fn injected_policy(template: &PodTemplateSpec) -> Option<&str> {
    template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == SIDECAR_CONTAINER_NAME)
        .and_then(policy_of)
}

/// True when the template carries the sidecar container
pub fn has_sidecar(containers: &[Container]) -> bool {
    containers.iter().any(|c| c.name == SIDECAR_CONTAINER_NAME)
}

fn upsert_container(containers: &mut Vec<Container>, container: Container) {
    match containers.iter_mut().find(|c| c.name == container.name) {
        Some(existing) => *existing = container,
        None => containers.push(container),
    }
}

/// Spec equality with quantity-valued fields compared by value
pub fn policy_spec_equal(a: &BackupPolicySpec, b: &BackupPolicySpec) -> bool {
    normalized(a) == normalized(b)
}

pub fn recovery_spec_equal(a: &RecoveryRequestSpec, b: &RecoveryRequestSpec) -> bool {
    a == b
}

/// Template equality with container resource quantities compared by value.
///
/// The API server may rewrite `1024Mi` as `1Gi`; that is not a change.
pub fn template_equal(a: &PodTemplateSpec, b: &PodTemplateSpec) -> bool {
    normalized_template(a) == normalized_template(b)
}

fn normalized_template(template: &PodTemplateSpec) -> PodTemplateSpec {
    let mut template = template.clone();
    if let Some(spec) = template.spec.as_mut() {
        let init = spec.init_containers.iter_mut().flatten();
        for container in spec.containers.iter_mut().chain(init) {
            if let Some(resources) = container.resources.as_mut() {
                normalize_resources(resources);
            }
        }
    }
    template
}

fn normalized(spec: &BackupPolicySpec) -> BackupPolicySpec {
    let mut spec = spec.clone();
    if let Some(resources) = spec.resources.as_mut() {
        normalize_resources(resources);
    }
    if let Some(local) = spec.backend.local.as_mut() {
        if let Some(empty_dir) = local.volume_source.empty_dir.as_mut() {
            empty_dir.size_limit = empty_dir.size_limit.as_ref().map(quantity::canonical);
        }
        if let Some(ephemeral) = local.volume_source.ephemeral.as_mut() {
            if let Some(claim) = ephemeral.volume_claim_template.as_mut() {
                if let Some(res) = claim.spec.resources.as_mut() {
                    normalize_quantities(&mut res.limits);
                    normalize_quantities(&mut res.requests);
                }
            }
        }
    }
    spec
}

fn normalize_resources(resources: &mut ResourceRequirements) {
    normalize_quantities(&mut resources.limits);
    normalize_quantities(&mut resources.requests);
}

fn normalize_quantities(map: &mut Option<BTreeMap<String, Quantity>>) {
    if let Some(map) = map.as_mut() {
        for value in map.values_mut() {
            *value = quantity::canonical(value);
        }
    }
}
