//! kubevm controller - Kubernetes workload lifecycle service
//!
//! This is the main entry point for the controller service. It runs
//! workloads as Kubernetes Deployments and serves the routes listed in
//! [`kubevm_controller::service`].

use std::sync::Arc;

use kubevm_controller::service::{create_router, AppState};
use kubevm_controller::{ControllerConfig, LifecycleController};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,kubevm=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting kubevm controller");

    // Load configuration from environment
    let listen_addr = std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let config = ControllerConfig::from_env();

    tracing::info!(
        namespace = %config.namespace,
        builder_image = %config.builder_image,
        runtime_image = %config.runtime_image,
        endpoint = ?config.endpoint,
        kubeconfig = ?config.kubeconfig,
        "Loaded controller configuration"
    );

    let controller = Arc::new(LifecycleController::from_config(config)?);

    // Requests reconnect on demand if this fails.
    if let Err(e) = controller.ensure_connected().await {
        tracing::warn!(error = %e, "Kubernetes API not reachable yet");
    }

    let shutdown = CancellationToken::new();
    let app = create_router(AppState::new(controller, shutdown.clone()));

    // Start server
    tracing::info!(listen_addr = %listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    tracing::info!("Controller stopped");
    Ok(())
}

/// Wait for Ctrl-C, then cancel every in-flight lifecycle call.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}
