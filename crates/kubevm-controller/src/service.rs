//! HTTP front end for the lifecycle controller.
//!
//! # HTTP Endpoints
//!
//! ## Health & Readiness
//! - `GET /health` - Health check
//! - `GET /ready` - Readiness check (connects to the API server)
//!
//! ## Workload Lifecycle
//! - `POST /v1/workloads/name` - Resolve the resource name for an identity
//! - `POST /v1/workloads/start` - (Re)create a workload
//! - `POST /v1/workloads/stop` - Delete a workload
//! - `POST /v1/workloads/destroy` - Forceful teardown (no-op)
//! - `POST /v1/workloads/deploy` - Pre-stage a workload (no-op)

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use kubevm_core::WorkloadIdentity;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::controller::{LifecycleController, VirtualMachine};
use crate::types::{DeploymentSpec, DestroyOptions, StartRequest, StopOptions};
use crate::ControllerError;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    controller: Arc<LifecycleController>,
    shutdown: CancellationToken,
}

impl AppState {
    /// Create the state. Cancelling `shutdown` cancels every in-flight
    /// lifecycle call.
    #[must_use]
    pub fn new(controller: Arc<LifecycleController>, shutdown: CancellationToken) -> Self {
        Self {
            controller,
            shutdown,
        }
    }
}

// ============================================================================
// Health Endpoints
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "kubevm-controller",
    })
}

async fn ready_handler(State(state): State<AppState>) -> Response {
    match state.controller.ensure_connected().await {
        Ok(()) => (StatusCode::OK, "ready").into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Not ready");
            error_response(&e)
        }
    }
}

// ============================================================================
// Workload Endpoints
// ============================================================================

/// Error response format.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
}

impl ErrorResponse {
    fn new(error: impl Into<String>, code: u16) -> Self {
        Self {
            error: error.into(),
            code,
        }
    }
}

fn error_response(e: &ControllerError) -> Response {
    let code = e.http_status_code();
    (
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(ErrorResponse::new(e.to_string(), code)),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct NameBody {
    identity: WorkloadIdentity,
}

#[derive(Debug, Serialize)]
struct NameResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct StartBody {
    identity: WorkloadIdentity,
    #[serde(default = "DeploymentSpec::builder_and_runtime")]
    spec: DeploymentSpec,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct StopBody {
    identity: WorkloadIdentity,
    #[serde(default)]
    options: StopOptions,
}

#[derive(Debug, Deserialize)]
struct DestroyBody {
    identity: WorkloadIdentity,
    #[serde(default)]
    options: DestroyOptions,
}

#[derive(Debug, Deserialize)]
struct DeployBody {
    identity: WorkloadIdentity,
    #[serde(default = "DeploymentSpec::builder_and_runtime")]
    spec: DeploymentSpec,
}

/// POST /v1/workloads/name
async fn name_handler(State(state): State<AppState>, Json(req): Json<NameBody>) -> Response {
    match state.controller.resolve_name(&req.identity, None) {
        Ok(name) => Json(NameResponse { name }).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /v1/workloads/start
async fn start_handler(State(state): State<AppState>, Json(req): Json<StartBody>) -> Response {
    let request = StartRequest {
        spec: req.spec,
        env: req.env,
        prelaunch: None,
    };
    let cancel = state.shutdown.child_token();

    match state.controller.start(&req.identity, &request, &cancel).await {
        Ok(handle) => {
            tracing::info!(
                identity = %req.identity,
                name = %handle.name,
                "Started workload via HTTP API"
            );
            (StatusCode::CREATED, Json(handle)).into_response()
        }
        Err(e) => {
            tracing::error!(identity = %req.identity, error = %e, "Failed to start workload");
            error_response(&e)
        }
    }
}

/// POST /v1/workloads/stop
async fn stop_handler(State(state): State<AppState>, Json(req): Json<StopBody>) -> Response {
    let cancel = state.shutdown.child_token();

    match state.controller.stop(&req.identity, &req.options, &cancel).await {
        Ok(()) => {
            tracing::info!(identity = %req.identity, "Stopped workload via HTTP API");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            tracing::error!(identity = %req.identity, error = %e, "Failed to stop workload");
            error_response(&e)
        }
    }
}

/// POST /v1/workloads/destroy
async fn destroy_handler(State(state): State<AppState>, Json(req): Json<DestroyBody>) -> Response {
    match state.controller.destroy(&req.identity, &req.options).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /v1/workloads/deploy
async fn deploy_handler(State(state): State<AppState>, Json(req): Json<DeployBody>) -> Response {
    match state.controller.deploy(&req.identity, &req.spec).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the controller router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & readiness
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        // Workload lifecycle
        .route("/v1/workloads/name", post(name_handler))
        .route("/v1/workloads/start", post(start_handler))
        .route("/v1/workloads/stop", post(stop_handler))
        .route("/v1/workloads/destroy", post(destroy_handler))
        .route("/v1/workloads/deploy", post(deploy_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
