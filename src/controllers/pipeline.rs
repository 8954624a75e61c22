//! Wiring of one kind's feed, dispatcher and workers

use futures::Stream;
use kube::runtime::watcher;
use tokio::sync::mpsc;
use tracing::info;

use super::worker::run_worker;
use super::{Context, KindController};
use crate::feed::dispatcher::run_dispatcher;
use crate::feed::{run_feed, ChangeFeed, Watched};

/// Notifications buffered between a feed and its dispatcher
const FEED_CHANNEL_CAPACITY: usize = 1024;

/// Spawn the feed, dispatcher and workers of one kind on the context's tracker
pub fn spawn_pipeline<K, S>(kind: &KindController<K>, stream: S, ctx: &Context)
where
    K: Watched,
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);

    ctx.tasks.spawn(run_feed(
        ChangeFeed::new(kind.store.clone()),
        stream,
        ctx.config.resync_period,
        tx,
        ctx.shutdown.clone(),
    ));
    ctx.tasks.spawn(run_dispatcher(
        rx,
        kind.queue.clone(),
        ctx.events.clone(),
        ctx.shutdown.clone(),
    ));
    for id in 0..ctx.config.workers_per_kind {
        ctx.tasks.spawn(run_worker(
            K::KIND,
            id,
            kind.queue.clone(),
            kind.reconciler.clone(),
            ctx.config.max_num_requeues,
            ctx.errors.clone(),
        ));
    }

    info!(kind = K::KIND, workers = ctx.config.workers_per_kind, "Controller pipeline started");
}
