//! BackupPolicy controller
//!
//! Watches BackupPolicy resources and feeds them to the policy reconciler.

use std::sync::Arc;

use kube::{
    api::ListParams,
    runtime::{watcher, WatchStreamExt},
    Api, Client,
};
use tracing::{error, info};

use super::{spawn_pipeline, Context};
use crate::crd::BackupPolicy;
use crate::error::Result;

/// Start the BackupPolicy controller
pub async fn run(client: Client, ctx: Arc<Context>) -> Result<()> {
    let api: Api<BackupPolicy> = match &ctx.config.watch_namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("BackupPolicy CRD not installed: {}", e);
        return Err(e.into());
    }

    info!("Starting BackupPolicy controller");

    let stream = watcher(api, watcher::Config::default()).default_backoff();
    spawn_pipeline(&ctx.policies, stream, &ctx);
    Ok(())
}
