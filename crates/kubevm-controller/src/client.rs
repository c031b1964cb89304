//! Orchestrator client capabilities.
//!
//! The controller talks to the cluster only through [`OrchestratorClient`],
//! obtained from an [`OrchestratorClientFactory`]. [`KubeClientFactory`]
//! builds the real client from in-cluster or kubeconfig credentials;
//! [`ClientCache`] keeps one connected client around and rebuilds it once it
//! is too old or has been invalidated.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, DeleteParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::types::{ControllerConfig, WorkloadHandle};
use crate::{ControllerError, Result};

/// A failure reported by (or on the way to) the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A resource with the same name already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Any other API status.
    #[error("API error {code} ({reason}): {message}")]
    Api {
        /// HTTP status code.
        code: u16,
        /// Machine-readable reason.
        reason: String,
        /// Human-readable message.
        message: String,
    },

    /// The request never got a response.
    #[error("transport error: {0}")]
    Transport(String),
}

impl RemoteError {
    /// Whether the resource was missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether the API server rejected our credentials.
    #[must_use]
    pub const fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Api { code: 401, .. })
    }

    /// Whether the same call might succeed later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Api {
                    code: 429 | 500 | 502 | 503 | 504,
                    ..
                }
        )
    }

    /// Whether the client that produced this error should be rebuilt.
    #[must_use]
    pub const fn invalidates_client(&self) -> bool {
        self.is_auth_failure() || matches!(self, Self::Transport(_))
    }
}

impl From<kube::Error> for RemoteError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => match resp.code {
                404 => Self::NotFound(resp.message),
                409 if resp.reason == "AlreadyExists" => Self::AlreadyExists(resp.message),
                code => Self::Api {
                    code,
                    reason: resp.reason,
                    message: resp.message,
                },
            },
            other => Self::Transport(other.to_string()),
        }
    }
}

/// How dependents of a deleted resource are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PropagationPolicy {
    /// Keep the parent visible until every dependent is gone.
    #[default]
    Foreground,
    /// Delete the parent now, dependents in the background.
    Background,
    /// Leave dependents behind.
    Orphan,
}

impl PropagationPolicy {
    fn to_kube(self) -> kube::api::PropagationPolicy {
        match self {
            Self::Foreground => kube::api::PropagationPolicy::Foreground,
            Self::Background => kube::api::PropagationPolicy::Background,
            Self::Orphan => kube::api::PropagationPolicy::Orphan,
        }
    }
}

/// Parameters for a delete call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeleteOptions {
    /// Dependent handling.
    pub propagation: PropagationPolicy,
    /// Grace period for the pods, if not the cluster default.
    pub grace_period: Option<Duration>,
}

impl DeleteOptions {
    /// Foreground cascade with an optional grace period.
    #[must_use]
    pub const fn foreground(grace_period: Option<Duration>) -> Self {
        Self {
            propagation: PropagationPolicy::Foreground,
            grace_period,
        }
    }

    fn to_kube(self) -> DeleteParams {
        DeleteParams {
            propagation_policy: Some(self.propagation.to_kube()),
            grace_period_seconds: self
                .grace_period
                .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX)),
            ..Default::default()
        }
    }
}

/// Create and delete workloads in a namespace.
#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    /// Create `deployment` in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns the orchestrator's rejection or a transport failure.
    async fn create_workload(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> std::result::Result<WorkloadHandle, RemoteError>;

    /// Delete the deployment `name` in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::NotFound`] if there is no such deployment.
    async fn delete_workload(
        &self,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> std::result::Result<(), RemoteError>;
}

/// Build connected [`OrchestratorClient`]s.
#[async_trait]
pub trait OrchestratorClientFactory: Send + Sync {
    /// Resolve credentials and connect.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::ClientUnavailable`] if no usable
    /// configuration is found or the API server cannot be reached.
    async fn connect(&self) -> Result<Arc<dyn OrchestratorClient>>;
}

/// [`OrchestratorClient`] backed by the Kubernetes `apps/v1` Deployment API.
#[derive(Clone)]
pub struct KubeOrchestrator {
    client: Client,
}

impl KubeOrchestrator {
    /// Wrap an existing client.
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl OrchestratorClient for KubeOrchestrator {
    async fn create_workload(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> std::result::Result<WorkloadHandle, RemoteError> {
        let created = self
            .deployments(namespace)
            .create(&PostParams::default(), deployment)
            .await?;

        Ok(WorkloadHandle {
            name: created
                .metadata
                .name
                .or_else(|| deployment.metadata.name.clone())
                .unwrap_or_default(),
            namespace: created
                .metadata
                .namespace
                .unwrap_or_else(|| namespace.to_string()),
            uid: created.metadata.uid,
        })
    }

    async fn delete_workload(
        &self,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> std::result::Result<(), RemoteError> {
        self.deployments(namespace)
            .delete(name, &options.to_kube())
            .await?;
        Ok(())
    }
}

/// Where client credentials come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// The pod's service account.
    InCluster,
    /// A kubeconfig file, optionally with the cluster URL replaced.
    Kubeconfig {
        /// File to load.
        path: PathBuf,
        /// Cluster URL override.
        endpoint: Option<String>,
    },
    /// A bare API server URL without credentials.
    Endpoint(String),
}

impl CredentialSource {
    /// Pick a credential source.
    ///
    /// A kubeconfig file is used when it exists: the configured path, or
    /// `~/.kube/config` when none is configured. Otherwise a bare endpoint,
    /// then the in-cluster service account.
    #[must_use]
    pub fn discover(
        endpoint: Option<&str>,
        kubeconfig: Option<&Path>,
        home: Option<&Path>,
    ) -> Self {
        let endpoint = endpoint.filter(|e| !e.is_empty()).map(str::to_string);

        let path = kubeconfig
            .map(Path::to_path_buf)
            .or_else(|| home.map(|h| h.join(".kube").join("config")))
            .filter(|p| p.is_file());

        match (path, endpoint) {
            (Some(path), endpoint) => Self::Kubeconfig { path, endpoint },
            (None, Some(endpoint)) => Self::Endpoint(endpoint),
            (None, None) => Self::InCluster,
        }
    }

    async fn build(&self) -> std::result::Result<kube::Config, String> {
        match self {
            Self::InCluster => kube::Config::incluster().map_err(|e| e.to_string()),
            Self::Kubeconfig { path, endpoint } => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
                let mut config =
                    kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .map_err(|e| e.to_string())?;
                if let Some(endpoint) = endpoint {
                    config.cluster_url = parse_endpoint(endpoint)?;
                }
                Ok(config)
            }
            Self::Endpoint(endpoint) => Ok(kube::Config::new(parse_endpoint(endpoint)?)),
        }
    }
}

fn parse_endpoint(endpoint: &str) -> std::result::Result<http::Uri, String> {
    endpoint
        .parse::<http::Uri>()
        .map_err(|e| format!("invalid endpoint {endpoint}: {e}"))
}

/// Connects to a real cluster.
#[derive(Debug, Clone)]
pub struct KubeClientFactory {
    endpoint: Option<String>,
    kubeconfig: Option<PathBuf>,
    home: Option<PathBuf>,
}

impl KubeClientFactory {
    /// Create a factory from the controller configuration, using `$HOME` for
    /// the default kubeconfig location.
    #[must_use]
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            kubeconfig: config.kubeconfig.clone(),
            home: std::env::var_os("HOME").map(PathBuf::from),
        }
    }

    /// The credential source this factory will use.
    #[must_use]
    pub fn source(&self) -> CredentialSource {
        CredentialSource::discover(
            self.endpoint.as_deref(),
            self.kubeconfig.as_deref(),
            self.home.as_deref(),
        )
    }
}

#[async_trait]
impl OrchestratorClientFactory for KubeClientFactory {
    async fn connect(&self) -> Result<Arc<dyn OrchestratorClient>> {
        let source = self.source();
        debug!(?source, "Resolving Kubernetes credentials");

        let config = source
            .build()
            .await
            .map_err(ControllerError::ClientUnavailable)?;

        info!(host = %config.cluster_url, "Creating API client");

        let client = Client::try_from(config)
            .map_err(|e| ControllerError::ClientUnavailable(e.to_string()))?;

        let version = client
            .apiserver_version()
            .await
            .map_err(|e| ControllerError::ClientUnavailable(e.to_string()))?;

        info!(
            major = %version.major,
            minor = %version.minor,
            git_version = %version.git_version,
            git_commit = %version.git_commit,
            platform = %version.platform,
            "Connected to Kubernetes cluster"
        );

        Ok(Arc::new(KubeOrchestrator::new(client)))
    }
}

struct CachedClient {
    client: Arc<dyn OrchestratorClient>,
    connected_at: Instant,
}

/// Holds one connected client and hands it out until it goes stale.
///
/// At most one connect runs at a time; callers that find the cache empty
/// while a connect is in flight wait for it and share its client.
pub struct ClientCache {
    factory: Arc<dyn OrchestratorClientFactory>,
    ttl: Duration,
    slot: Mutex<Option<CachedClient>>,
    connecting: tokio::sync::Mutex<()>,
}

impl ClientCache {
    /// Create an empty cache. A zero `ttl` connects on every call.
    #[must_use]
    pub fn new(factory: Arc<dyn OrchestratorClientFactory>, ttl: Duration) -> Self {
        Self {
            factory,
            ttl,
            slot: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    /// Return the cached client, connecting a new one if needed.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::ClientUnavailable`] if connecting fails.
    pub async fn get(&self) -> Result<Arc<dyn OrchestratorClient>> {
        if let Some(client) = self.fresh() {
            return Ok(client);
        }

        let _connecting = self.connecting.lock().await;
        if let Some(client) = self.fresh() {
            return Ok(client);
        }

        let client = self.factory.connect().await?;
        *self.slot.lock() = Some(CachedClient {
            client: Arc::clone(&client),
            connected_at: Instant::now(),
        });
        Ok(client)
    }

    /// Drop the cached client so the next call reconnects.
    pub fn invalidate(&self) {
        if self.slot.lock().take().is_some() {
            debug!("Invalidated cached orchestrator client");
        }
    }

    /// Whether a client that is still within its TTL is cached.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.fresh().is_some()
    }

    fn fresh(&self) -> Option<Arc<dyn OrchestratorClient>> {
        self.slot
            .lock()
            .as_ref()
            .filter(|cached| cached.connected_at.elapsed() < self.ttl)
            .map(|cached| Arc::clone(&cached.client))
    }
}

/// In-memory orchestrator doubles for testing without a cluster.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// A call received by [`MockOrchestrator`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum MockCall {
        /// `create_workload`.
        Create {
            /// Namespace.
            namespace: String,
            /// Deployment name.
            name: String,
        },
        /// `delete_workload`.
        Delete {
            /// Namespace.
            namespace: String,
            /// Deployment name.
            name: String,
            /// Options passed.
            options: DeleteOptions,
        },
    }

    /// An orchestrator that keeps deployments in memory.
    ///
    /// Creating a name that already exists fails with
    /// [`RemoteError::AlreadyExists`] and deleting a missing one with
    /// [`RemoteError::NotFound`], like the real API server.
    #[derive(Default)]
    pub struct MockOrchestrator {
        deployments: Mutex<HashMap<(String, String), Deployment>>,
        calls: Mutex<Vec<MockCall>>,
        create_failure: Mutex<Option<RemoteError>>,
        delete_failure: Mutex<Option<RemoteError>>,
        stall_creates: AtomicBool,
        stall_deletes: AtomicBool,
        uids: AtomicUsize,
    }

    impl MockOrchestrator {
        /// Create an empty orchestrator.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every create fail with `err` until cleared with `None`.
        pub fn fail_creates(&self, err: Option<RemoteError>) {
            *self.create_failure.lock() = err;
        }

        /// Make every delete fail with `err` until cleared with `None`.
        pub fn fail_deletes(&self, err: Option<RemoteError>) {
            *self.delete_failure.lock() = err;
        }

        /// Make creates hang forever.
        pub fn stall_creates(&self, stall: bool) {
            self.stall_creates.store(stall, Ordering::SeqCst);
        }

        /// Make deletes hang forever.
        pub fn stall_deletes(&self, stall: bool) {
            self.stall_deletes.store(stall, Ordering::SeqCst);
        }

        /// Put a deployment in place without going through the API.
        pub fn insert(&self, namespace: &str, deployment: Deployment) {
            let name = deployment.metadata.name.clone().unwrap_or_default();
            self.deployments
                .lock()
                .insert((namespace.to_string(), name), deployment);
        }

        /// Get a stored deployment.
        #[must_use]
        pub fn get(&self, namespace: &str, name: &str) -> Option<Deployment> {
            self.deployments
                .lock()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
        }

        /// Number of stored deployments.
        #[must_use]
        pub fn deployment_count(&self) -> usize {
            self.deployments.lock().len()
        }

        /// Every call received so far.
        #[must_use]
        pub fn calls(&self) -> Vec<MockCall> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl OrchestratorClient for MockOrchestrator {
        async fn create_workload(
            &self,
            namespace: &str,
            deployment: &Deployment,
        ) -> std::result::Result<WorkloadHandle, RemoteError> {
            let name = deployment.metadata.name.clone().unwrap_or_default();
            self.calls.lock().push(MockCall::Create {
                namespace: namespace.to_string(),
                name: name.clone(),
            });

            if self.stall_creates.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if let Some(err) = self.create_failure.lock().clone() {
                return Err(err);
            }

            let mut deployments = self.deployments.lock();
            let key = (namespace.to_string(), name.clone());
            if deployments.contains_key(&key) {
                return Err(RemoteError::AlreadyExists(format!(
                    "deployments.apps \"{name}\" already exists"
                )));
            }
            deployments.insert(key, deployment.clone());

            let uid = self.uids.fetch_add(1, Ordering::SeqCst);
            Ok(WorkloadHandle {
                name,
                namespace: namespace.to_string(),
                uid: Some(format!("mock-uid-{uid}")),
            })
        }

        async fn delete_workload(
            &self,
            namespace: &str,
            name: &str,
            options: &DeleteOptions,
        ) -> std::result::Result<(), RemoteError> {
            self.calls.lock().push(MockCall::Delete {
                namespace: namespace.to_string(),
                name: name.to_string(),
                options: *options,
            });

            if self.stall_deletes.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if let Some(err) = self.delete_failure.lock().clone() {
                return Err(err);
            }

            self.deployments
                .lock()
                .remove(&(namespace.to_string(), name.to_string()))
                .map(|_| ())
                .ok_or_else(|| {
                    RemoteError::NotFound(format!("deployments.apps \"{name}\" not found"))
                })
        }
    }

    /// A factory that hands out one shared [`MockOrchestrator`].
    #[derive(Default)]
    pub struct MockClientFactory {
        orchestrator: Arc<MockOrchestrator>,
        unavailable: Mutex<Option<String>>,
        connect_delay: Mutex<Option<Duration>>,
        connects: AtomicUsize,
    }

    impl MockClientFactory {
        /// Create a factory around a fresh orchestrator.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// The orchestrator every connection talks to.
        #[must_use]
        pub fn orchestrator(&self) -> Arc<MockOrchestrator> {
            Arc::clone(&self.orchestrator)
        }

        /// Make `connect` fail with `reason` until cleared with `None`.
        pub fn set_unavailable(&self, reason: Option<&str>) {
            *self.unavailable.lock() = reason.map(str::to_string);
        }

        /// Make every connect take `delay` before it completes.
        pub fn set_connect_delay(&self, delay: Option<Duration>) {
            *self.connect_delay.lock() = delay;
        }

        /// Number of successful connects.
        #[must_use]
        pub fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OrchestratorClientFactory for MockClientFactory {
        async fn connect(&self) -> Result<Arc<dyn OrchestratorClient>> {
            let delay = *self.connect_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(reason) = self.unavailable.lock().clone() {
                return Err(ControllerError::ClientUnavailable(reason));
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::clone(&self.orchestrator) as Arc<dyn OrchestratorClient>)
        }
    }
}
