//! RecoveryRequest controller
//!
//! Watches RecoveryRequest resources and feeds them to the recovery reconciler.

use std::sync::Arc;

use kube::{
    api::ListParams,
    runtime::{watcher, WatchStreamExt},
    Api, Client,
};
use tracing::{error, info};

use super::{spawn_pipeline, Context};
use crate::crd::RecoveryRequest;
use crate::error::Result;

/// Start the RecoveryRequest controller
pub async fn run(client: Client, ctx: Arc<Context>) -> Result<()> {
    let api: Api<RecoveryRequest> = match &ctx.config.watch_namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("RecoveryRequest CRD not installed: {}", e);
        return Err(e.into());
    }

    info!("Starting RecoveryRequest controller");

    let stream = watcher(api, watcher::Config::default()).default_backoff();
    spawn_pipeline(&ctx.recoveries, stream, &ctx);
    Ok(())
}
