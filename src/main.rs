//! Workload Backup Operator
//!
//! Main entry point for the operator. Loads configuration, sets up the
//! Kubernetes client, starts both CRD controllers and the metrics server,
//! and drains everything on shutdown.

use std::sync::Arc;

use kube::Client;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use workload_backup_operator::{
    config::OperatorConfig,
    controllers::{self, Collaborators, Context},
    metrics,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Workload Backup Operator");

    let config = OperatorConfig::from_env()?;
    info!(
        namespace = config.watch_namespace.as_deref().unwrap_or("*"),
        workers = config.workers_per_kind,
        max_requeues = config.max_num_requeues,
        image = %config.sidecar_image.reference(&config.sidecar_image.tag),
        rbac = config.enable_rbac,
        "Loaded configuration"
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let collaborators = Collaborators::from_client(client.clone(), &config);
    let metrics_port = config.metrics_port;
    let context = Arc::new(Context::new(config, collaborators));

    let mut metrics_handle = tokio::spawn(metrics::serve(metrics_port, context.shutdown.clone()));

    controllers::run_policy_controller(client.clone(), context.clone()).await?;
    controllers::run_recovery_controller(client, context.clone()).await?;
    metrics::set_ready(true);

    tokio::select! {
        result = &mut metrics_handle => {
            error!(?result, "Metrics server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
        }
    }

    metrics::set_ready(false);
    context.stop().await;
    if !metrics_handle.is_finished() {
        metrics_handle.abort();
    }

    info!("Workload Backup Operator stopped");
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
