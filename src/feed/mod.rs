//! Change feed: a list+watch stream turned into a local cache and typed
//! add/update/delete notifications.
//!
//! The feed is the only writer of its [`Store`]. Reconcilers read the store by
//! key instead of calling the API server.

pub mod dispatcher;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{Stream, StreamExt};
use kube::runtime::reflector::{self, store::Writer, ObjectRef};
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

/// A resource kind the controller watches
pub trait Watched: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static {
    /// Kind name used in logs and metrics
    const KIND: &'static str;

    /// Event reason recorded when an object fails validation
    const INVALID_REASON: &'static str;

    /// Whether a periodic resync queues every cached object again
    const REQUEUE_ON_RESYNC: bool = true;

    /// Schema-level checks; invalid objects are never queued
    fn validate(&self) -> Result<()>;

    /// Whether two versions have the same spec
    fn spec_equal(&self, other: &Self) -> bool;
}

/// Typed change notification
#[derive(Clone, Debug)]
pub enum FeedEvent<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    /// Carries the last known state so the key survives the object
    Deleted(Arc<K>),
    /// Periodic re-delivery of a cached object
    Resync(Arc<K>),
}

impl<K: Resource> FeedEvent<K> {
    /// Object the notification is about (the new version for updates)
    pub fn object(&self) -> &Arc<K> {
        match self {
            FeedEvent::Added(obj) | FeedEvent::Deleted(obj) | FeedEvent::Resync(obj) => obj,
            FeedEvent::Updated { new, .. } => new,
        }
    }
}

/// `namespace/name`, or `name` for cluster scoped objects
pub fn object_key<K: Resource>(obj: &K) -> String {
    match obj.meta().namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, obj.name_any()),
        _ => obj.name_any(),
    }
}

/// Split a queue key into namespace and name
pub fn split_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((ns, name)) => (Some(ns), name),
        None => (None, key),
    }
}

/// Keyed snapshot of one kind, backed by a kube reflector store.
///
/// Clones share the same cache. Readers never block on the writer.
pub struct Store<K: Resource<DynamicType = ()> + Clone + 'static> {
    reader: reflector::Store<K>,
    writer: Arc<Mutex<Writer<K>>>,
}

impl<K: Resource<DynamicType = ()> + Clone + 'static> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            reader: self.reader.clone(),
            writer: self.writer.clone(),
        }
    }
}

impl<K: Resource<DynamicType = ()> + Clone + 'static> Default for Store<K> {
    fn default() -> Self {
        let writer = Writer::default();
        Self {
            reader: writer.as_reader(),
            writer: Arc::new(Mutex::new(writer)),
        }
    }
}

impl<K: Resource<DynamicType = ()> + Clone + 'static> Store<K> {
    pub fn get(&self, key: &str) -> Option<Arc<K>> {
        let (namespace, name) = split_key(key);
        let mut reference = ObjectRef::new(name);
        if let Some(ns) = namespace {
            reference = reference.within(ns);
        }
        self.reader.get(&reference)
    }

    /// All cached objects in a namespace
    pub fn list_namespace(&self, namespace: &str) -> Vec<Arc<K>> {
        self.reader
            .state()
            .into_iter()
            .filter(|obj| obj.meta().namespace.as_deref() == Some(namespace))
            .collect()
    }

    /// Every cached object
    pub fn state(&self) -> Vec<Arc<K>> {
        self.reader.state()
    }

    pub fn len(&self) -> usize {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reader.is_empty()
    }

    /// Seed or overwrite an entry. Used by tests; the feed goes through `apply`.
    pub fn insert(&self, obj: K) {
        self.apply(&watcher::Event::Apply(obj));
    }

    fn apply(&self, event: &watcher::Event<K>) {
        // A panicking writer leaves the previous snapshot in place, so poisoning is ignored.
        self.writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .apply_watcher_event(event);
    }
}

/// Applies watcher events to a [`Store`] and derives notifications
pub struct ChangeFeed<K: Resource<DynamicType = ()> + Clone + 'static> {
    store: Store<K>,
}

impl<K: Resource<DynamicType = ()> + Clone + 'static> ChangeFeed<K> {
    pub fn new(store: Store<K>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store<K> {
        &self.store
    }

    /// Apply one transport event, returning the notifications it produces
    pub fn apply(&mut self, event: watcher::Event<K>) -> Vec<FeedEvent<K>> {
        match &event {
            // The reflector buffers a re-list and swaps it in on InitDone
            watcher::Event::Init | watcher::Event::InitApply(_) => {
                self.store.apply(&event);
                Vec::new()
            }
            watcher::Event::InitDone => {
                let before: HashMap<String, Arc<K>> = self
                    .store
                    .state()
                    .into_iter()
                    .map(|obj| (object_key(obj.as_ref()), obj))
                    .collect();
                self.store.apply(&event);
                diff(before, self.store.state())
            }
            watcher::Event::Apply(obj) => {
                let key = object_key(obj);
                let old = self.store.get(&key);
                self.store.apply(&event);
                let new = self.store.get(&key).unwrap_or_else(|| Arc::new(obj.clone()));
                match old {
                    Some(old) => vec![FeedEvent::Updated { old, new }],
                    None => vec![FeedEvent::Added(new)],
                }
            }
            watcher::Event::Delete(obj) => {
                self.store.apply(&event);
                vec![FeedEvent::Deleted(Arc::new(obj.clone()))]
            }
        }
    }

    /// Re-deliver every cached object
    pub fn resync(&self) -> Vec<FeedEvent<K>> {
        self.store
            .state()
            .into_iter()
            .map(FeedEvent::Resync)
            .collect()
    }
}

/// Notifications turning the `before` snapshot into the `after` listing
fn diff<K: Resource>(mut before: HashMap<String, Arc<K>>, after: Vec<Arc<K>>) -> Vec<FeedEvent<K>> {
    let mut events = Vec::with_capacity(after.len());
    for new in after {
        match before.remove(&object_key(new.as_ref())) {
            Some(old) => events.push(FeedEvent::Updated { old, new }),
            None => events.push(FeedEvent::Added(new)),
        }
    }
    events.extend(before.into_values().map(FeedEvent::Deleted));
    events
}

/// Drive a watcher stream and the resync timer into `tx` until cancelled.
pub async fn run_feed<K, S>(
    mut feed: ChangeFeed<K>,
    stream: S,
    resync_period: Duration,
    tx: mpsc::Sender<FeedEvent<K>>,
    shutdown: CancellationToken,
) where
    K: Watched,
    S: Stream<Item = std::result::Result<watcher::Event<K>, watcher::Error>> + Send,
{
    futures::pin_mut!(stream);
    let mut resync = tokio::time::interval_at(
        tokio::time::Instant::now() + resync_period,
        resync_period,
    );

    info!(kind = K::KIND, resync_secs = resync_period.as_secs(), "Change feed started");

    loop {
        let events = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = resync.tick() => {
                debug!(kind = K::KIND, cached = feed.store().len(), "Resyncing change feed");
                feed.resync()
            }
            next = stream.next() => match next {
                Some(Ok(event)) => feed.apply(event),
                Some(Err(e)) => {
                    warn!(kind = K::KIND, error = %e, "Watch stream error");
                    continue;
                }
                None => {
                    warn!(kind = K::KIND, "Watch stream ended");
                    break;
                }
            },
        };

        for event in events {
            if tx.send(event).await.is_err() {
                debug!(kind = K::KIND, "Dispatcher gone, stopping change feed");
                return;
            }
        }
    }

    info!(kind = K::KIND, "Change feed stopped");
}
