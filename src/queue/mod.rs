//! Rate-limited, deduplicating work queue of resource keys
//!
//! A key appears at most once among the pending entries. A key handed to a
//! worker is marked as processing; adding it again while it is processing
//! parks it until the worker calls [`WorkQueue::done`], so two workers never
//! hold the same key at once.

mod rate_limiter;

pub use rate_limiter::ExponentialBackoff;

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::trace;

use crate::metrics;

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    /// Keys waiting to be processed (queued or parked behind processing)
    dirty: HashSet<String>,
    processing: HashSet<String>,
    shutting_down: bool,
}

struct Inner {
    name: String,
    state: Mutex<State>,
    limiter: Mutex<ExponentialBackoff>,
    notify: Notify,
}

/// Cloneable handle to a shared queue
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>, limiter: ExponentialBackoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State::default()),
                limiter: Mutex::new(limiter),
                notify: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Mark a key as needing processing
    pub fn add(&self, key: &str) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            trace!(queue = %self.inner.name, key, "Key in processing, deferring");
            return;
        }
        state.queue.push_back(key.to_string());
        self.record_depth(&state);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Wait for the next key. `None` once shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    self.record_depth(&state);
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Finish processing a key, re-queueing it if it was added meanwhile
    pub fn done(&self, key: &str) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            self.record_depth(&state);
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Add the key once `delay` has passed
    pub fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Add the key after the backoff its failure history calls for
    pub fn add_rate_limited(&self, key: &str) {
        let delay = self.limiter().when(key);
        trace!(queue = %self.inner.name, key, delay_ms = delay.as_millis() as u64, "Requeueing with backoff");
        self.add_after(key, delay);
    }

    /// Clear a key's failure history
    pub fn forget(&self, key: &str) {
        self.limiter().forget(key);
    }

    /// Number of rate-limited re-adds since the key was last forgotten
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.limiter().num_requeues(key)
    }

    /// Keys ready to be handed out
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting keys; waiting workers drain what is queued then get `None`
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn limiter(&self) -> MutexGuard<'_, ExponentialBackoff> {
        self.inner.limiter.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_depth(&self, state: &State) {
        metrics::QUEUE_DEPTH
            .with_label_values(&[&self.inner.name])
            .set(state.queue.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue {
        WorkQueue::new("test", ExponentialBackoff::default())
    }

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let q = queue();
        q.add("ns/a");
        q.add("ns/a");
        q.add("ns/b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("ns/a"));
        assert_eq!(q.get().await.as_deref(), Some("ns/b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn re_add_while_processing_is_deferred() {
        let q = queue();
        q.add("ns/a");
        let key = q.get().await.unwrap();

        q.add("ns/a");
        assert_eq!(q.len(), 0, "key must not be handed to a second worker");

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("ns/a"));
    }

    #[tokio::test]
    async fn shutdown_drains_then_stops() {
        let q = queue();
        q.add("ns/a");
        q.shut_down();
        q.add("ns/b");
        assert_eq!(q.get().await.as_deref(), Some("ns/a"));
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn get_wakes_on_add() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.add("ns/late");
        assert_eq!(waiter.await.unwrap().as_deref(), Some("ns/late"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_add_waits_for_backoff() {
        let q = WorkQueue::new(
            "test",
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60)),
        );
        q.add_rate_limited("ns/a");
        q.add_rate_limited("ns/a");
        assert_eq!(q.num_requeues("ns/a"), 2);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(q.is_empty());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(q.len(), 1);

        q.forget("ns/a");
        assert_eq!(q.num_requeues("ns/a"), 0);
    }
}
