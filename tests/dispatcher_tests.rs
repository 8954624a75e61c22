//! Integration tests for the validate-and-filter step between feed and queue

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::runtime::watcher::Event;

use workload_backup_operator::adapters::reasons;
use workload_backup_operator::crd::{BackupPolicy, RecoveryPhase};
use workload_backup_operator::feed::dispatcher::dispatch;
use workload_backup_operator::feed::{ChangeFeed, FeedEvent, Store};
use workload_backup_operator::queue::{ExponentialBackoff, WorkQueue};

use common::{policy, policy_spec, request, with_phase, FakeCluster};

fn queue() -> WorkQueue {
    WorkQueue::new("test", ExponentialBackoff::default())
}

fn with_memory(limit: &str) -> BackupPolicy {
    let mut spec = policy_spec(&[("app", "db")]);
    spec.resources = Some(ResourceRequirements {
        limits: Some(BTreeMap::from([(
            "memory".to_string(),
            Quantity(limit.to_string()),
        )])),
        ..Default::default()
    });
    policy("db", spec)
}

fn updated<K>(old: K, new: K) -> FeedEvent<K> {
    FeedEvent::Updated {
        old: Arc::new(old),
        new: Arc::new(new),
    }
}

#[tokio::test]
async fn valid_add_is_queued() {
    let cluster = FakeCluster::new();
    let q = queue();

    let key = dispatch(
        FeedEvent::Added(Arc::new(policy("db", policy_spec(&[("app", "db")])))),
        &q,
        cluster.as_ref(),
    )
    .await;

    assert_eq!(key.as_deref(), Some("apps/db"));
    assert_eq!(q.len(), 1);
}

#[tokio::test]
async fn invalid_add_records_warning_and_is_dropped() {
    let cluster = FakeCluster::new();
    let q = queue();
    let mut spec = policy_spec(&[("app", "db")]);
    spec.schedule = "sometimes".to_string();

    let key = dispatch(FeedEvent::Added(Arc::new(policy("db", spec))), &q, cluster.as_ref()).await;

    assert!(key.is_none());
    assert!(q.is_empty());
    let events = cluster.events_with_reason(reasons::INVALID_BACKUP_POLICY);
    assert_eq!(events.len(), 1);
    assert!(events[0].warning);
    assert!(events[0].message.starts_with("Reason: "));
}

#[tokio::test]
async fn status_only_update_is_not_queued() {
    let cluster = FakeCluster::new();
    let q = queue();
    let old = request("restore", "db", "db");
    let new = with_phase(old.clone(), RecoveryPhase::Running);

    assert!(dispatch(updated(old, new), &q, cluster.as_ref()).await.is_none());
    assert!(q.is_empty());
    assert!(cluster.events().is_empty());
}

#[tokio::test]
async fn metadata_only_update_is_not_queued() {
    let cluster = FakeCluster::new();
    let q = queue();
    let old = policy("db", policy_spec(&[("app", "db")]));
    let mut new = old.clone();
    new.metadata.resource_version = Some("42".to_string());
    new.metadata.annotations = Some(BTreeMap::from([(
        "note".to_string(),
        "touched".to_string(),
    )]));

    assert!(dispatch(updated(old, new), &q, cluster.as_ref()).await.is_none());
}

#[tokio::test]
async fn reformatted_quantity_is_not_queued() {
    let cluster = FakeCluster::new();
    let q = queue();

    let key = dispatch(updated(with_memory("1Gi"), with_memory("1024Mi")), &q, cluster.as_ref()).await;

    assert!(key.is_none());
    assert!(q.is_empty());
}

#[tokio::test]
async fn changed_quantity_is_queued() {
    let cluster = FakeCluster::new();
    let q = queue();

    let key = dispatch(updated(with_memory("1Gi"), with_memory("2Gi")), &q, cluster.as_ref()).await;

    assert_eq!(key.as_deref(), Some("apps/db"));
}

#[tokio::test]
async fn invalid_update_is_not_queued() {
    let cluster = FakeCluster::new();
    let q = queue();
    let old = request("restore", "db", "db");
    let mut new = old.clone();
    new.spec.workload.kind = "CronJob".to_string();

    assert!(dispatch(updated(old, new), &q, cluster.as_ref()).await.is_none());
    assert_eq!(cluster.events_with_reason(reasons::INVALID_RECOVERY_REQUEST).len(), 1);
}

#[tokio::test]
async fn delete_is_always_queued() {
    let cluster = FakeCluster::new();
    let q = queue();
    let mut spec = policy_spec(&[("app", "db")]);
    spec.schedule = "sometimes".to_string();

    let key = dispatch(FeedEvent::Deleted(Arc::new(policy("db", spec))), &q, cluster.as_ref()).await;

    assert_eq!(key.as_deref(), Some("apps/db"));
    assert!(cluster.events().is_empty());
}

#[tokio::test]
async fn resync_queues_unchanged_policy() {
    let cluster = FakeCluster::new();
    let q = queue();
    let mut feed = ChangeFeed::new(Store::default());
    feed.apply(Event::Apply(policy("db", policy_spec(&[("app", "db")]))));

    let mut queued = Vec::new();
    for event in feed.resync() {
        queued.extend(dispatch(event, &q, cluster.as_ref()).await);
    }

    assert_eq!(queued, vec!["apps/db".to_string()]);
    assert_eq!(q.len(), 1);
}

#[tokio::test]
async fn resync_does_not_requeue_requests() {
    let cluster = FakeCluster::new();
    let q = queue();
    let failed = with_phase(request("restore", "db", "db"), RecoveryPhase::Failed);

    assert!(dispatch(FeedEvent::Resync(Arc::new(failed)), &q, cluster.as_ref())
        .await
        .is_none());
    assert!(q.is_empty());
}

#[tokio::test]
async fn resync_of_invalid_policy_is_dropped_quietly() {
    let cluster = FakeCluster::new();
    let q = queue();
    let mut spec = policy_spec(&[("app", "db")]);
    spec.schedule = "sometimes".to_string();

    let key = dispatch(FeedEvent::Resync(Arc::new(policy("db", spec))), &q, cluster.as_ref()).await;

    assert!(key.is_none());
    assert!(q.is_empty());
    assert!(cluster.events().is_empty());
}
