//! Node Observer - image storage and memory allocation watcher
//!
//! Watches every node in the cluster and periodically re-lists them,
//! logging image storage and memory allocation whenever they change.

use anyhow::Result;
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use observer_lib::{
    health::components, ChangeCache, HealthRegistry, KubeNodeSource, NodeObserver,
    ObserverMetrics, Reconciler, StructuredLogger,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const OBSERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "node-observer", version, about)]
struct Args {
    /// Kube config for outside of cluster access
    #[arg(long, env = "KUBECONFIG_PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let args = Args::parse();
    let config = config::ObserverConfig::load()?;
    info!(instance = %config.instance_name, "Observer configured");

    let client = build_client(args.config.as_deref()).await.map_err(|e| {
        error!(error = %e, "Failed to create Kubernetes client");
        e
    })?;

    let health_registry = HealthRegistry::new();
    health_registry.register(components::WATCH).await;
    health_registry.register(components::POLL).await;

    let logger = StructuredLogger::new(&config.instance_name);
    logger.log_startup(OBSERVER_VERSION);

    let observer = NodeObserver::new(ChangeCache::new(), logger.clone(), ObserverMetrics::new());
    let source = Arc::new(KubeNodeSource::new(client));

    let (shutdown_tx, _) = broadcast::channel(1);
    let reconciler = Reconciler::new(
        source,
        observer,
        health_registry.clone(),
        config.reconciler(),
    )
    .spawn(&shutdown_tx);

    let app_state = Arc::new(api::AppState::new(health_registry.clone()));
    let mut api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    health_registry.set_ready(true).await;

    let reason = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            "SIGINT received"
        }
        served = &mut api_handle => {
            match served {
                Ok(Ok(())) => info!("API server stopped"),
                Ok(Err(e)) => error!(error = %e, "API server failed"),
                Err(e) => error!(error = %e, "API server task failed"),
            }
            "API server exited"
        }
    };
    logger.log_shutdown(reason);

    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());
    reconciler.join().await;
    api_handle.abort();

    info!("Shutdown complete");
    Ok(())
}

/// In-cluster config unless a kubeconfig file is given
async fn build_client(kubeconfig: Option<&Path>) -> Result<kube::Client> {
    let config = match kubeconfig {
        None => {
            info!("Using in cluster config");
            kube::Config::incluster()?
        }
        Some(path) => {
            info!(path = %path.display(), "Using out of cluster config");
            let kubeconfig = Kubeconfig::read_from(path)?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
        }
    };

    Ok(kube::Client::try_from(config)?)
}
