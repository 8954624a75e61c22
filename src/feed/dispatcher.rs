//! Validate-and-filter-then-enqueue step between the change feed and the queue

use kube::runtime::events::EventType;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{object_key, FeedEvent, Watched};
use crate::adapters::EventRecorder;
use crate::queue::WorkQueue;

/// Decide whether a notification needs reconciling and enqueue its key.
///
/// Returns the key when one was queued.
pub async fn dispatch<K: Watched>(
    event: FeedEvent<K>,
    queue: &WorkQueue,
    recorder: &dyn EventRecorder,
) -> Option<String> {
    let key = object_key(event.object().as_ref());

    match &event {
        FeedEvent::Added(obj) => {
            if !accept(obj.as_ref(), &key, recorder).await {
                return None;
            }
        }
        FeedEvent::Updated { old, new } => {
            if !accept(new.as_ref(), &key, recorder).await {
                return None;
            }
            if old.spec_equal(new) {
                debug!(kind = K::KIND, key = %key, "Spec unchanged, not queueing");
                return None;
            }
        }
        FeedEvent::Deleted(_) => {}
        FeedEvent::Resync(obj) => {
            if !K::REQUEUE_ON_RESYNC {
                return None;
            }
            // Already reported when the object arrived
            if let Err(e) = obj.validate() {
                debug!(kind = K::KIND, key = %key, error = %e, "Invalid object, not resyncing");
                return None;
            }
        }
    }

    queue.add(&key);
    Some(key)
}

async fn accept<K: Watched>(obj: &K, key: &str, recorder: &dyn EventRecorder) -> bool {
    match obj.validate() {
        Ok(()) => true,
        Err(e) => {
            warn!(kind = K::KIND, key = %key, error = %e, "Invalid object, not queueing");
            recorder
                .record(
                    &obj.object_ref(&()),
                    EventType::Warning,
                    K::INVALID_REASON,
                    format!("Reason: {}", e),
                )
                .await;
            false
        }
    }
}

/// Consume notifications until the feed closes the channel or shutdown.
pub async fn run_dispatcher<K: Watched>(
    mut rx: mpsc::Receiver<FeedEvent<K>>,
    queue: WorkQueue,
    recorder: std::sync::Arc<dyn EventRecorder>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => {
                    dispatch(event, &queue, recorder.as_ref()).await;
                }
                None => break,
            },
        }
    }
    info!(kind = K::KIND, "Dispatcher stopped");
}
