//! Pod volume merging
//!
//! All operations are by volume name and keep unrelated volumes in their
//! original relative order.

use k8s_openapi::api::core::v1::{
    DownwardAPIVolumeFile, DownwardAPIVolumeSource, EmptyDirVolumeSource, ObjectFieldSelector,
    Volume,
};

use super::{LOCAL_VOLUME_NAME, PODINFO_VOLUME_NAME, SCRATCH_VOLUME_NAME};
use crate::crd::Backend;

/// What `merge_local_volume` did to the backend volume
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalVolumeChange {
    Inserted,
    Replaced,
    Removed,
    Unchanged,
}

/// Replace the volume with the same name in place, or append it
pub fn upsert_volume(volumes: &mut Vec<Volume>, volume: Volume) {
    match volumes.iter_mut().find(|v| v.name == volume.name) {
        Some(existing) => *existing = volume,
        None => volumes.push(volume),
    }
}

/// Remove the named volume. Returns whether anything was removed.
pub fn remove_volume(volumes: &mut Vec<Volume>, name: &str) -> bool {
    let before = volumes.len();
    volumes.retain(|v| v.name != name);
    volumes.len() != before
}

pub fn scratch_volume() -> Volume {
    Volume {
        name: SCRATCH_VOLUME_NAME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

/// Downward API volume exposing the pod's labels to the sidecar
pub fn podinfo_volume() -> Volume {
    Volume {
        name: PODINFO_VOLUME_NAME.to_string(),
        downward_api: Some(DownwardAPIVolumeSource {
            items: Some(vec![DownwardAPIVolumeFile {
                path: "labels".to_string(),
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.labels".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn upsert_scratch_volume(volumes: &mut Vec<Volume>) {
    upsert_volume(volumes, scratch_volume());
}

pub fn upsert_downward_volume(volumes: &mut Vec<Volume>) {
    upsert_volume(volumes, podinfo_volume());
}

/// Backend volume for a local backend, `None` for remote backends
pub fn local_volume(backend: &Backend) -> Option<Volume> {
    backend
        .local
        .as_ref()
        .map(|local| local.volume_source.to_volume(LOCAL_VOLUME_NAME))
}

/// Bring the backend volume in line with the new backend.
///
/// `old` is the backend that was last applied, if known. A backend that stays
/// local gets its source replaced and one that became local gains the volume.
/// When the new backend is remote the volume is dropped unless the old backend
/// is known to have been remote too. Re-applying the same backend is a no-op.
pub fn merge_local_volume(
    volumes: &mut Vec<Volume>,
    old: Option<&Backend>,
    new: &Backend,
) -> LocalVolumeChange {
    let position = volumes.iter().position(|v| v.name == LOCAL_VOLUME_NAME);

    match (local_volume(new), position) {
        (Some(desired), Some(pos)) if volumes[pos] == desired => LocalVolumeChange::Unchanged,
        (Some(desired), Some(pos)) => {
            volumes[pos] = desired;
            LocalVolumeChange::Replaced
        }
        (Some(desired), None) => {
            volumes.push(desired);
            LocalVolumeChange::Inserted
        }
        (None, Some(pos)) if old.map_or(true, Backend::is_local) => {
            volumes.remove(pos);
            LocalVolumeChange::Removed
        }
        (None, _) => LocalVolumeChange::Unchanged,
    }
}
