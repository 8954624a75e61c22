//! Worker loop: pull a key, reconcile it, apply the retry policy

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::error::Error;
use crate::metrics;
use crate::queue::WorkQueue;
use crate::reconcilers::Reconciler;

/// Receives keys that exhausted their retries
pub trait ErrorSink: Send + Sync {
    fn report(&self, kind: &str, key: &str, err: &Error);
}

/// Logs dropped keys and counts them
#[derive(Clone, Copy, Debug, Default)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn report(&self, kind: &str, key: &str, err: &Error) {
        error!(kind, key, error = %err, "Dropping key after exhausting retries");
        metrics::DROPPED_KEYS.with_label_values(&[kind]).inc();
    }
}

/// Process one key. Returns `false` once the queue is shut down and drained.
///
/// A key that fails `max_retries` times in a row is forgotten and reported
/// to `sink` exactly once.
#[instrument(skip_all, fields(kind = kind, queue = queue.name()))]
pub async fn process_next_item(
    kind: &str,
    queue: &WorkQueue,
    reconciler: &dyn Reconciler,
    max_retries: u32,
    sink: &dyn ErrorSink,
) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };

    let result = {
        let _timer = metrics::RECONCILE_DURATION
            .with_label_values(&[kind])
            .start_timer();
        metrics::RECONCILIATIONS.with_label_values(&[kind]).inc();
        reconciler.reconcile(&key).await
    };

    match result {
        Ok(()) => {
            debug!(key = %key, "Reconciled");
            queue.forget(&key);
        }
        Err(e) => {
            metrics::RECONCILIATION_ERRORS
                .with_label_values(&[kind, e.metric_label()])
                .inc();
            let failures = queue.num_requeues(&key) + 1;
            if failures < max_retries {
                warn!(key = %key, failures, error = %e, "Reconciliation failed, scheduling retry");
                queue.add_rate_limited(&key);
            } else {
                queue.forget(&key);
                sink.report(kind, &key, &e);
            }
        }
    }

    queue.done(&key);
    true
}

/// Run workers until the queue shuts down
pub async fn run_worker(
    kind: &'static str,
    id: usize,
    queue: WorkQueue,
    reconciler: Arc<dyn Reconciler>,
    max_retries: u32,
    sink: Arc<dyn ErrorSink>,
) {
    debug!(kind, worker = id, "Worker started");
    while process_next_item(kind, &queue, reconciler.as_ref(), max_retries, sink.as_ref()).await {}
    info!(kind, worker = id, "Worker stopped");
}
