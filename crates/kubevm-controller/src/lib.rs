//! Kubernetes Deployment lifecycle controller for kubevm workloads.
//!
//! This crate provides the [`VirtualMachine`] trait and the
//! [`LifecycleController`] implementation, which runs each workload as a
//! Kubernetes Deployment named after its resolved identity. It handles:
//!
//! - Name resolution from `(network, peer, base name)` identities
//! - Start: precreate cleanup, Deployment construction, create
//! - Stop: foreground-cascade delete with a grace period
//! - Client discovery (in-cluster, kubeconfig, bare endpoint) and reuse
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Peer / HTTP API                          │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    LifecycleController                          │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────────────┐    │
//! │  │   Start     │ │    Stop     │ │  Destroy / Deploy       │    │
//! │  │             │ │             │ │  (no-ops)               │    │
//! │  └─────────────┘ └─────────────┘ └─────────────────────────┘    │
//! │                         │                                       │
//! │      ┌──────────────────┼──────────────────┐                    │
//! │      ▼                  ▼                  ▼                    │
//! │ ┌───────────┐    ┌─────────────┐    ┌─────────────┐             │
//! │ │  Client   │    │ Deployment  │    │  Lifecycle  │             │
//! │ │  Cache    │    │  Builder    │    │  Observer   │             │
//! │ └───────────┘    └─────────────┘    └─────────────┘             │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Kubernetes API Server                        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use kubevm_controller::{
//!     ControllerConfig, DeploymentSpec, LifecycleController, StartRequest, StopOptions,
//!     VirtualMachine,
//! };
//! use kubevm_core::WorkloadIdentity;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let controller = LifecycleController::from_config(ControllerConfig::from_env())?;
//! let identity = WorkloadIdentity::new("net1", "peer0", "mycc:1.0");
//! let cancel = CancellationToken::new();
//!
//! let request = StartRequest::new(DeploymentSpec::builder_and_runtime())
//!     .with_env("CORE_CHAINCODE_ID_NAME", "mycc:1.0");
//! let handle = controller.start(&identity, &request, &cancel).await?;
//! println!("Started {}/{}", handle.namespace, handle.name);
//!
//! controller.stop(&identity, &StopOptions::default(), &cancel).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Testing
//!
//! For testing without a real Kubernetes cluster, enable the `test-utils`
//! feature and hand the controller a mock client factory:
//!
//! ```ignore
//! use std::sync::Arc;
//! use kubevm_controller::{ControllerConfig, LifecycleController, MockClientFactory};
//!
//! let factory = Arc::new(MockClientFactory::new());
//! let orchestrator = factory.orchestrator();
//! let controller = LifecycleController::new(ControllerConfig::default(), factory);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod client;
pub mod controller;
pub mod deployment;
pub mod error;
pub mod lifecycle;
pub mod service;
pub mod types;

pub use client::{
    ClientCache, CredentialSource, DeleteOptions, KubeClientFactory, KubeOrchestrator,
    OrchestratorClient, OrchestratorClientFactory, PropagationPolicy, RemoteError,
};
pub use controller::{LifecycleController, PrecreateCleanup, VirtualMachine};
pub use error::{ControllerError, ErrorKind, Result};
pub use lifecycle::{
    validate_transition, InvalidTransition, LifecycleObserver, TracingObserver, Transition,
    WorkloadState,
};
pub use types::{
    ContainerSpec, ControllerConfig, DeploymentSpec, DestroyOptions, Operation, PrelaunchHook,
    StartRequest, StopOptions, WorkloadHandle,
};

#[cfg(any(test, feature = "test-utils"))]
pub use client::mock::{MockCall, MockClientFactory, MockOrchestrator};
#[cfg(any(test, feature = "test-utils"))]
pub use lifecycle::mock::RecordingObserver;
