//! Types for the controller crate.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{ControllerError, Result};

/// The lifecycle operation an error or log line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Create (or recreate) a workload.
    Start,
    /// Delete a workload.
    Stop,
    /// Forceful teardown.
    Destroy,
    /// Pre-stage packaging step.
    Deploy,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Destroy => "destroy",
            Self::Deploy => "deploy",
        };
        f.write_str(s)
    }
}

/// A single container in a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name, unique within the workload.
    pub name: String,
    /// Image reference. When unset the configured builder or runtime image
    /// is used.
    #[serde(default)]
    pub image: Option<String>,
    /// Entrypoint override.
    #[serde(default)]
    pub command: Vec<String>,
    /// Arguments to the entrypoint.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ContainerSpec {
    /// Create a container spec that uses the configured default image.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the image reference.
    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Set the container arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Caller-supplied description of a workload.
///
/// The naming and lifecycle logic never looks inside it; it is only turned
/// into a Deployment on create.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    /// Replica count. Falls back to the configured default.
    #[serde(default)]
    pub replicas: Option<i32>,
    /// Extra pod labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Containers that run to completion before the main containers start.
    #[serde(default)]
    pub init_containers: Vec<ContainerSpec>,
    /// Main containers.
    pub containers: Vec<ContainerSpec>,
}

impl DeploymentSpec {
    /// A `builder` init container followed by a `runtime` container, both on
    /// the configured default images.
    #[must_use]
    pub fn builder_and_runtime() -> Self {
        Self {
            init_containers: vec![ContainerSpec::new("builder")],
            containers: vec![ContainerSpec::new("runtime")],
            ..Default::default()
        }
    }

    /// Set the replica count.
    #[must_use]
    pub fn with_replicas(mut self, replicas: i32) -> Self {
        self.replicas = Some(replicas);
        self
    }

    /// Add a pod label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Check this description can be turned into a Deployment.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::InvalidSpec`] when there are no main
    /// containers, the replica count is negative, or container names repeat.
    pub fn validate(&self) -> Result<()> {
        if self.containers.is_empty() {
            return Err(ControllerError::InvalidSpec(
                "at least one container is required".to_string(),
            ));
        }
        if let Some(replicas) = self.replicas {
            if replicas < 0 {
                return Err(ControllerError::InvalidSpec(format!(
                    "replica count {replicas} is negative"
                )));
            }
        }

        let mut seen = BTreeSet::new();
        for container in self.init_containers.iter().chain(&self.containers) {
            if container.name.is_empty() {
                return Err(ControllerError::InvalidSpec(
                    "container name is empty".to_string(),
                ));
            }
            if !seen.insert(container.name.as_str()) {
                return Err(ControllerError::InvalidSpec(format!(
                    "duplicate container name {}",
                    container.name
                )));
            }
        }

        Ok(())
    }
}

/// Runs after the resolved name is known and before the workload is created.
#[async_trait]
pub trait PrelaunchHook: Send + Sync {
    /// Prepare for launching `name`.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason; the workload is then not created.
    async fn prelaunch(&self, name: &str) -> std::result::Result<(), String>;
}

/// Everything `start` needs besides the identity.
#[derive(Clone, Default)]
pub struct StartRequest {
    /// Workload description.
    pub spec: DeploymentSpec,
    /// Environment merged into every main container, overriding the
    /// container's own values.
    pub env: BTreeMap<String, String>,
    /// Optional hook run right before create.
    pub prelaunch: Option<Arc<dyn PrelaunchHook>>,
}

impl StartRequest {
    /// Create a request for `spec` with no extra environment.
    #[must_use]
    pub fn new(spec: DeploymentSpec) -> Self {
        Self {
            spec,
            ..Default::default()
        }
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Attach a prelaunch hook.
    #[must_use]
    pub fn with_prelaunch(mut self, hook: Arc<dyn PrelaunchHook>) -> Self {
        self.prelaunch = Some(hook);
        self
    }
}

impl fmt::Debug for StartRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartRequest")
            .field("spec", &self.spec)
            .field("env", &self.env)
            .field("prelaunch", &self.prelaunch.is_some())
            .finish()
    }
}

/// Options for `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopOptions {
    /// Grace period given to the pods before they are killed.
    #[serde(with = "duration_secs", default = "StopOptions::default_timeout")]
    pub timeout: Duration,
    /// Leave the process running. Deployments have no process to keep, so
    /// this is only logged.
    #[serde(default)]
    pub keep_process: bool,
    /// Leave the resource in place. Deployments are always deleted, so this
    /// is only logged.
    #[serde(default)]
    pub keep_resource: bool,
}

impl StopOptions {
    const fn default_timeout() -> Duration {
        Duration::from_secs(10)
    }

    /// Stop with the given grace period.
    #[must_use]
    pub const fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            keep_process: false,
            keep_resource: false,
        }
    }
}

impl Default for StopOptions {
    fn default() -> Self {
        Self::with_timeout(Self::default_timeout())
    }
}

/// Options for `destroy`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyOptions {
    /// Tear down even if the workload is running.
    #[serde(default)]
    pub force: bool,
    /// Remove images after teardown.
    #[serde(default)]
    pub prune_images: bool,
}

/// A workload created on the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadHandle {
    /// Resolved resource name.
    pub name: String,
    /// Namespace the resource lives in.
    pub namespace: String,
    /// Orchestrator-assigned uid, when reported.
    pub uid: Option<String>,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Configuration for the lifecycle controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Kubernetes namespace for workload deployments.
    #[serde(default = "ControllerConfig::default_namespace")]
    pub namespace: String,
    /// Image for init containers that don't name one.
    #[serde(default = "ControllerConfig::default_builder_image")]
    pub builder_image: String,
    /// Image for main containers that don't name one.
    #[serde(default = "ControllerConfig::default_runtime_image")]
    pub runtime_image: String,
    /// API server URL overriding the one in the kubeconfig.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Path to a kubeconfig file.
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
    /// Replica count for specs that don't set one.
    #[serde(default = "ControllerConfig::default_replicas")]
    pub default_replicas: i32,
    /// Seconds a connected client is reused before it is rebuilt.
    #[serde(default = "ControllerConfig::default_client_ttl")]
    pub client_ttl_seconds: u64,
    /// Treat a missing deployment on stop as success.
    #[serde(default)]
    pub tolerate_missing_on_stop: bool,
}

impl ControllerConfig {
    fn default_namespace() -> String {
        "default".to_string()
    }

    fn default_builder_image() -> String {
        "hyperledger/fabric-ccenv:latest".to_string()
    }

    fn default_runtime_image() -> String {
        "hyperledger/fabric-baseos:latest".to_string()
    }

    const fn default_replicas() -> i32 {
        1
    }

    const fn default_client_ttl() -> u64 {
        300 // 5 minutes
    }

    /// Create a config with the given namespace.
    #[must_use]
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Get the client TTL as a `Duration`.
    #[must_use]
    pub fn client_ttl(&self) -> Duration {
        Duration::from_secs(self.client_ttl_seconds)
    }

    /// Load configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - `KUBEVM_NAMESPACE`: Kubernetes namespace for workloads
    /// - `KUBEVM_BUILDER_IMAGE`: Default init container image
    /// - `KUBEVM_RUNTIME_IMAGE`: Default main container image
    /// - `KUBEVM_K8S_ENDPOINT`: API server URL override
    /// - `KUBEVM_KUBECONFIG`: Path to a kubeconfig file
    /// - `KUBEVM_DEFAULT_REPLICAS`: Replica count for specs without one
    /// - `KUBEVM_CLIENT_TTL_SECONDS`: Client reuse window
    /// - `KUBEVM_TOLERATE_MISSING_ON_STOP`: `true` to ignore not-found on stop
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = lookup("KUBEVM_NAMESPACE") {
            config.namespace = val;
        }
        if let Some(val) = lookup("KUBEVM_BUILDER_IMAGE") {
            config.builder_image = val;
        }
        if let Some(val) = lookup("KUBEVM_RUNTIME_IMAGE") {
            config.runtime_image = val;
        }
        if let Some(val) = lookup("KUBEVM_K8S_ENDPOINT").filter(|v| !v.is_empty()) {
            config.endpoint = Some(val);
        }
        if let Some(val) = lookup("KUBEVM_KUBECONFIG").filter(|v| !v.is_empty()) {
            config.kubeconfig = Some(PathBuf::from(val));
        }
        if let Some(val) = lookup("KUBEVM_DEFAULT_REPLICAS") {
            if let Ok(n) = val.parse() {
                config.default_replicas = n;
            }
        }
        if let Some(val) = lookup("KUBEVM_CLIENT_TTL_SECONDS") {
            if let Ok(n) = val.parse() {
                config.client_ttl_seconds = n;
            }
        }
        if let Some(val) = lookup("KUBEVM_TOLERATE_MISSING_ON_STOP") {
            config.tolerate_missing_on_stop =
                matches!(val.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        config
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace or an image is empty, or the
    /// default replica count is negative.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(ControllerError::Config("namespace is empty".to_string()));
        }
        if self.builder_image.is_empty() || self.runtime_image.is_empty() {
            return Err(ControllerError::Config(
                "builder and runtime images must be set".to_string(),
            ));
        }
        if self.default_replicas < 0 {
            return Err(ControllerError::Config(format!(
                "default replica count {} is negative",
                self.default_replicas
            )));
        }
        Ok(())
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: Self::default_namespace(),
            builder_image: Self::default_builder_image(),
            runtime_image: Self::default_runtime_image(),
            endpoint: None,
            kubeconfig: None,
            default_replicas: Self::default_replicas(),
            client_ttl_seconds: Self::default_client_ttl(),
            tolerate_missing_on_stop: false,
        }
    }
}
