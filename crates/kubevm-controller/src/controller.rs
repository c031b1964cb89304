//! Kubernetes lifecycle controller.
//!
//! This module provides the [`LifecycleController`], which runs workloads as
//! Kubernetes Deployments named after their resolved identity.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use kubevm_core::name::{self, FormatFn};
use kubevm_core::WorkloadIdentity;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::client::{
    ClientCache, DeleteOptions, KubeClientFactory, OrchestratorClient, OrchestratorClientFactory,
    RemoteError,
};
use crate::deployment::build_deployment;
use crate::lifecycle::{LifecycleObserver, TracingObserver, Transition, WorkloadState};
use crate::types::{
    ControllerConfig, DeploymentSpec, DestroyOptions, Operation, StartRequest, StopOptions,
    WorkloadHandle,
};
use crate::{ControllerError, Result};

/// The lifecycle contract for an isolated workload.
#[async_trait]
pub trait VirtualMachine: Send + Sync {
    /// Resolve the resource name for `identity`, optionally through a
    /// formatting transform.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::NameResolution`] if the transform fails.
    fn resolve_name(&self, identity: &WorkloadIdentity, format: Option<FormatFn<'_>>)
        -> Result<String>;

    /// Pre-stage a workload. Reserved; currently does nothing.
    ///
    /// # Errors
    ///
    /// Never fails today.
    async fn deploy(&self, identity: &WorkloadIdentity, spec: &DeploymentSpec) -> Result<()>;

    /// (Re)create the workload, removing any previous instance first.
    ///
    /// # Errors
    ///
    /// Returns an error if no client is available, the request is invalid,
    /// the prelaunch hook fails, the create call fails, or `cancel` fires.
    async fn start(
        &self,
        identity: &WorkloadIdentity,
        request: &StartRequest,
        cancel: &CancellationToken,
    ) -> Result<WorkloadHandle>;

    /// Delete the workload.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::TeardownFailed`] if the delete call fails,
    /// including when there is nothing to delete.
    async fn stop(
        &self,
        identity: &WorkloadIdentity,
        options: &StopOptions,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Forceful teardown. Reserved; currently does nothing.
    ///
    /// # Errors
    ///
    /// Never fails today.
    async fn destroy(&self, identity: &WorkloadIdentity, options: &DestroyOptions) -> Result<()>;
}

/// What to do when the delete issued before a create fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrecreateCleanup {
    /// Ignore every outcome. A stale deployment from a crashed run must
    /// never block a fresh start.
    #[default]
    IgnoreErrors,
    /// Ignore not-found; fail the start on any other error.
    Strict,
}

/// Runs workloads as Kubernetes Deployments.
///
/// Each operation is a one-shot call against the API server. Nothing is
/// remembered about running workloads; only the connected client is reused.
/// Concurrent calls for the same identity are not serialized.
pub struct LifecycleController {
    config: ControllerConfig,
    clients: ClientCache,
    observer: Arc<dyn LifecycleObserver>,
    precreate_cleanup: PrecreateCleanup,
}

impl LifecycleController {
    /// Create a controller that logs transitions through `tracing`.
    #[must_use]
    pub fn new(config: ControllerConfig, factory: Arc<dyn OrchestratorClientFactory>) -> Self {
        Self::with_observer(config, factory, Arc::new(TracingObserver))
    }

    /// Create a controller with an explicit lifecycle observer.
    #[must_use]
    pub fn with_observer(
        config: ControllerConfig,
        factory: Arc<dyn OrchestratorClientFactory>,
        observer: Arc<dyn LifecycleObserver>,
    ) -> Self {
        let clients = ClientCache::new(factory, config.client_ttl());
        Self {
            config,
            clients,
            observer,
            precreate_cleanup: PrecreateCleanup::default(),
        }
    }

    /// Create a controller that talks to the cluster described by `config`.
    ///
    /// The client is connected lazily on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn from_config(config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        let factory = Arc::new(KubeClientFactory::new(&config));
        Ok(Self::new(config, factory))
    }

    /// Set the precreate cleanup policy.
    #[must_use]
    pub fn with_precreate_cleanup(mut self, policy: PrecreateCleanup) -> Self {
        self.precreate_cleanup = policy;
        self
    }

    /// Get a reference to the controller config.
    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Connect to the orchestrator now instead of on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::ClientUnavailable`] if connecting fails.
    pub async fn ensure_connected(&self) -> Result<()> {
        self.clients.get().await.map(|_| ())
    }

    async fn client(
        &self,
        operation: Operation,
        name: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn OrchestratorClient>> {
        cancellable(cancel, operation, name, self.clients.get())
            .await?
            .inspect_err(|e| debug!(%operation, error = %e, "Cannot create orchestrator client"))
    }

    fn note_remote_error(&self, err: &RemoteError) {
        if err.invalidates_client() {
            self.clients.invalidate();
        }
    }

    fn transition(
        &self,
        operation: Operation,
        name: &str,
        from: WorkloadState,
        to: WorkloadState,
        message: Option<String>,
    ) {
        self.observer.on_transition(&Transition {
            operation,
            name: name.to_string(),
            namespace: self.config.namespace.clone(),
            from,
            to,
            message,
        });
    }

    async fn clean_up_before_create(
        &self,
        client: &dyn OrchestratorClient,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let namespace = self.config.namespace.as_str();
        debug!(name = %name, namespace, "Cleaning up deployment before create");

        let outcome = cancellable(
            cancel,
            Operation::Start,
            Some(name),
            client.delete_workload(namespace, name, &DeleteOptions::foreground(None)),
        )
        .await?;

        let Err(err) = outcome else {
            debug!(name = %name, namespace, "Removed previous deployment");
            return Ok(());
        };
        self.note_remote_error(&err);

        match self.precreate_cleanup {
            PrecreateCleanup::Strict if !err.is_not_found() => {
                Err(ControllerError::TeardownFailed {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                    source: err,
                })
            }
            PrecreateCleanup::Strict | PrecreateCleanup::IgnoreErrors => {
                debug!(name = %name, namespace, error = %err, "Ignoring precreate cleanup result");
                Ok(())
            }
        }
    }
}

/// Race `fut` against `cancel`. Cancellation wins ties.
async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    operation: Operation,
    name: Option<&str>,
    fut: F,
) -> Result<F::Output> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ControllerError::Cancelled {
            operation,
            name: name.map(str::to_string),
        }),
        out = fut => Ok(out),
    }
}

#[async_trait]
impl VirtualMachine for LifecycleController {
    fn resolve_name(
        &self,
        identity: &WorkloadIdentity,
        format: Option<FormatFn<'_>>,
    ) -> Result<String> {
        Ok(name::resolve(identity, format)?)
    }

    async fn deploy(&self, identity: &WorkloadIdentity, spec: &DeploymentSpec) -> Result<()> {
        debug!(
            %identity,
            containers = spec.containers.len(),
            "Deploy is a no-op for Kubernetes workloads"
        );
        Ok(())
    }

    async fn start(
        &self,
        identity: &WorkloadIdentity,
        request: &StartRequest,
        cancel: &CancellationToken,
    ) -> Result<WorkloadHandle> {
        const OP: Operation = Operation::Start;

        let name = identity.require_name()?;
        request.spec.validate()?;

        let client = self.client(OP, Some(&name), cancel).await?;
        let namespace = self.config.namespace.as_str();

        self.clean_up_before_create(client.as_ref(), &name, cancel)
            .await?;

        let deployment = build_deployment(
            identity,
            &name,
            &request.spec,
            &request.env,
            &self.config,
        );

        debug!(
            name = %name,
            namespace,
            builder_image = %self.config.builder_image,
            runtime_image = %self.config.runtime_image,
            "Starting deployment"
        );

        if let Some(hook) = &request.prelaunch {
            cancellable(cancel, OP, Some(&name), hook.prelaunch(&name))
                .await?
                .map_err(|reason| ControllerError::PrelaunchFailed {
                    name: name.clone(),
                    reason,
                })?;
        }

        self.transition(OP, &name, WorkloadState::Absent, WorkloadState::Creating, None);

        let created = match cancellable(
            cancel,
            OP,
            Some(&name),
            client.create_workload(namespace, &deployment),
        )
        .await
        {
            Ok(created) => created,
            Err(cancelled) => {
                self.transition(
                    OP,
                    &name,
                    WorkloadState::Creating,
                    WorkloadState::Failed,
                    Some(cancelled.to_string()),
                );
                return Err(cancelled);
            }
        };

        match created {
            Ok(handle) => {
                self.transition(OP, &name, WorkloadState::Creating, WorkloadState::Running, None);
                info!(name = %name, namespace, uid = ?handle.uid, "Started deployment");
                Ok(handle)
            }
            Err(err) => {
                self.note_remote_error(&err);
                error!(name = %name, namespace, error = %err, "Could not create deployment");
                self.transition(
                    OP,
                    &name,
                    WorkloadState::Creating,
                    WorkloadState::Failed,
                    Some(err.to_string()),
                );
                Err(ControllerError::DeployFailed {
                    name,
                    namespace: namespace.to_string(),
                    source: err,
                })
            }
        }
    }

    async fn stop(
        &self,
        identity: &WorkloadIdentity,
        options: &StopOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        const OP: Operation = Operation::Stop;

        let name = name::normalize_for_delete(&identity.require_name()?);
        let client = self.client(OP, Some(&name), cancel).await?;
        let namespace = self.config.namespace.as_str();

        if options.keep_process || options.keep_resource {
            debug!(
                name = %name,
                keep_process = options.keep_process,
                keep_resource = options.keep_resource,
                "Deployments are always deleted; keep flags ignored"
            );
        }

        self.transition(OP, &name, WorkloadState::Running, WorkloadState::Deleting, None);

        let delete = DeleteOptions::foreground(Some(options.timeout));
        let deleted = match cancellable(
            cancel,
            OP,
            Some(&name),
            client.delete_workload(namespace, &name, &delete),
        )
        .await
        {
            Ok(deleted) => deleted,
            Err(cancelled) => {
                self.transition(
                    OP,
                    &name,
                    WorkloadState::Deleting,
                    WorkloadState::Failed,
                    Some(cancelled.to_string()),
                );
                return Err(cancelled);
            }
        };

        match deleted {
            Ok(()) => {
                self.transition(OP, &name, WorkloadState::Deleting, WorkloadState::Absent, None);
                debug!(name = %name, namespace, "Deleted deployment");
                Ok(())
            }
            Err(err) if err.is_not_found() && self.config.tolerate_missing_on_stop => {
                self.transition(OP, &name, WorkloadState::Deleting, WorkloadState::Absent, None);
                debug!(name = %name, namespace, "Deployment already gone");
                Ok(())
            }
            Err(err) => {
                self.note_remote_error(&err);
                debug!(name = %name, namespace, error = %err, "Delete deployment failed");
                self.transition(
                    OP,
                    &name,
                    WorkloadState::Deleting,
                    WorkloadState::Failed,
                    Some(err.to_string()),
                );
                Err(ControllerError::TeardownFailed {
                    name,
                    namespace: namespace.to_string(),
                    source: err,
                })
            }
        }
    }

    async fn destroy(&self, identity: &WorkloadIdentity, options: &DestroyOptions) -> Result<()> {
        debug!(
            %identity,
            force = options.force,
            prune_images = options.prune_images,
            "Destroy is a no-op for Kubernetes workloads"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::{MockCall, MockClientFactory, MockOrchestrator};
    use crate::client::PropagationPolicy;
    use crate::error::ErrorKind;
    use crate::lifecycle::mock::RecordingObserver;
    use crate::types::ContainerSpec;
    use k8s_openapi::api::apps::v1::Deployment;
    use kubevm_core::FormatError;
    use parking_lot::Mutex;
    use std::time::Duration;

    use WorkloadState::{Absent, Creating, Deleting, Failed, Running};

    struct Harness {
        controller: LifecycleController,
        factory: Arc<MockClientFactory>,
        orchestrator: Arc<MockOrchestrator>,
        observer: Arc<RecordingObserver>,
    }

    fn harness_with(config: ControllerConfig) -> Harness {
        let factory = Arc::new(MockClientFactory::new());
        let orchestrator = factory.orchestrator();
        let observer = Arc::new(RecordingObserver::new());
        let controller = LifecycleController::with_observer(
            config,
            Arc::clone(&factory) as Arc<dyn OrchestratorClientFactory>,
            Arc::clone(&observer) as Arc<dyn LifecycleObserver>,
        );
        Harness {
            controller,
            factory,
            orchestrator,
            observer,
        }
    }

    fn harness() -> Harness {
        harness_with(ControllerConfig::default())
    }

    fn identity() -> WorkloadIdentity {
        WorkloadIdentity::new("net1", "peer1", "mycc")
    }

    fn request() -> StartRequest {
        StartRequest::new(DeploymentSpec::builder_and_runtime())
            .with_env("CORE_CHAINCODE_ID_NAME", "mycc:1.0")
    }

    fn server_error() -> RemoteError {
        RemoteError::Api {
            code: 500,
            reason: "InternalError".to_string(),
            message: "etcd unavailable".to_string(),
        }
    }

    fn named(name: &str) -> Deployment {
        let mut deployment = Deployment::default();
        deployment.metadata.name = Some(name.to_string());
        deployment
    }

    #[derive(Default)]
    struct RecordingHook {
        names: Mutex<Vec<String>>,
        refuse: bool,
    }

    #[async_trait]
    impl crate::types::PrelaunchHook for RecordingHook {
        async fn prelaunch(&self, name: &str) -> std::result::Result<(), String> {
            self.names.lock().push(name.to_string());
            if self.refuse {
                Err("chaincode package missing".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn start_creates_deployment() {
        let h = harness();
        let cancel = CancellationToken::new();

        let handle = h
            .controller
            .start(&identity(), &request(), &cancel)
            .await
            .unwrap();

        assert_eq!(handle.name, "net1-peer1-mycc");
        assert_eq!(handle.namespace, "default");
        assert!(handle.uid.is_some());

        let deployment = h.orchestrator.get("default", "net1-peer1-mycc").unwrap();
        let spec = deployment.spec.unwrap();
        let container = &spec.template.spec.unwrap().containers[0];
        assert_eq!(container.env.as_ref().unwrap()[0].name, "CORE_CHAINCODE_ID_NAME");

        assert_eq!(
            h.orchestrator.calls(),
            vec![
                MockCall::Delete {
                    namespace: "default".to_string(),
                    name: "net1-peer1-mycc".to_string(),
                    options: DeleteOptions::foreground(None),
                },
                MockCall::Create {
                    namespace: "default".to_string(),
                    name: "net1-peer1-mycc".to_string(),
                },
            ]
        );
        assert_eq!(
            h.observer.path("net1-peer1-mycc"),
            vec![(Absent, Creating), (Creating, Running)]
        );
        assert!(h.observer.transitions().iter().all(Transition::is_valid));
    }

    #[tokio::test]
    async fn start_twice_recreates_instead_of_colliding() {
        let h = harness();
        let cancel = CancellationToken::new();

        h.controller
            .start(&identity(), &request(), &cancel)
            .await
            .unwrap();
        h.controller
            .start(&identity(), &request(), &cancel)
            .await
            .unwrap();

        assert_eq!(h.orchestrator.deployment_count(), 1);
        assert_eq!(h.orchestrator.calls().len(), 4);
        assert_eq!(h.factory.connect_count(), 1);
    }

    #[tokio::test]
    async fn start_ignores_precreate_cleanup_errors() {
        let h = harness();
        h.orchestrator.fail_deletes(Some(server_error()));

        let result = h
            .controller
            .start(&identity(), &request(), &CancellationToken::new())
            .await;

        assert!(result.is_ok());
        assert_eq!(h.orchestrator.deployment_count(), 1);
    }

    #[tokio::test]
    async fn strict_cleanup_fails_start_on_delete_error() {
        let h = harness();
        let controller = h.controller.with_precreate_cleanup(PrecreateCleanup::Strict);
        let cancel = CancellationToken::new();

        // Nothing to clean up is fine.
        controller
            .start(&identity(), &request(), &cancel)
            .await
            .unwrap();

        h.orchestrator.fail_deletes(Some(server_error()));
        let err = controller
            .start(&identity(), &request(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TeardownFailed);
    }

    #[tokio::test]
    async fn start_reports_name_conflict_left_after_cleanup() {
        let h = harness();
        h.orchestrator.insert("default", named("net1-peer1-mycc"));
        h.orchestrator.fail_deletes(Some(server_error()));

        let err = h
            .controller
            .start(&identity(), &request(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DeployFailed);
        assert_eq!(err.http_status_code(), 409);
        assert_eq!(err.resolved_name(), Some("net1-peer1-mycc"));
    }

    #[tokio::test]
    async fn start_create_failure_is_deploy_failed() {
        let h = harness();
        h.orchestrator.fail_creates(Some(RemoteError::Api {
            code: 403,
            reason: "Forbidden".to_string(),
            message: "exceeded quota".to_string(),
        }));

        let err = h
            .controller
            .start(&identity(), &request(), &CancellationToken::new())
            .await
            .unwrap_err();

        match &err {
            ControllerError::DeployFailed {
                name,
                namespace,
                source,
            } => {
                assert_eq!(name, "net1-peer1-mycc");
                assert_eq!(namespace, "default");
                assert!(matches!(source, RemoteError::Api { code: 403, .. }));
            }
            other => panic!("expected DeployFailed, got {other:?}"),
        }
        assert_eq!(h.orchestrator.deployment_count(), 0);
        assert_eq!(
            h.observer.path("net1-peer1-mycc"),
            vec![(Absent, Creating), (Creating, Failed)]
        );
    }

    #[tokio::test]
    async fn auth_failure_rebuilds_client() {
        let h = harness();
        let cancel = CancellationToken::new();
        h.orchestrator.fail_creates(Some(RemoteError::Api {
            code: 401,
            reason: "Unauthorized".to_string(),
            message: "token expired".to_string(),
        }));

        assert!(h
            .controller
            .start(&identity(), &request(), &cancel)
            .await
            .is_err());
        assert_eq!(h.factory.connect_count(), 1);

        h.orchestrator.fail_creates(None);
        h.controller
            .start(&identity(), &request(), &cancel)
            .await
            .unwrap();
        assert_eq!(h.factory.connect_count(), 2);
    }

    #[tokio::test]
    async fn start_without_client_is_unavailable() {
        let h = harness();
        h.factory.set_unavailable(Some("no kubeconfig and not in cluster"));

        let err = h
            .controller
            .start(&identity(), &request(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ClientUnavailable);
        assert!(h.orchestrator.calls().is_empty());
        assert!(h.observer.transitions().is_empty());
    }

    #[tokio::test]
    async fn start_rejects_invalid_requests() {
        let h = harness();
        let cancel = CancellationToken::new();

        let empty = WorkloadIdentity::new("", "", "");
        let err = h
            .controller
            .start(&empty, &request(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidSpec(_)));

        let no_containers = StartRequest::new(DeploymentSpec::default());
        let err = h
            .controller
            .start(&identity(), &no_containers, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidSpec(_)));

        assert!(h.orchestrator.calls().is_empty());
    }

    #[tokio::test]
    async fn start_uses_configured_namespace_and_images() {
        let config = ControllerConfig {
            namespace: "fabric".to_string(),
            runtime_image: "registry.local/runtime:2.5".to_string(),
            ..Default::default()
        };
        let h = harness_with(config);
        let request = StartRequest::new(DeploymentSpec {
            containers: vec![ContainerSpec::new("runtime")],
            ..Default::default()
        });

        let handle = h
            .controller
            .start(&identity(), &request, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(handle.namespace, "fabric");

        let deployment = h.orchestrator.get("fabric", "net1-peer1-mycc").unwrap();
        let pod_spec = deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(
            pod_spec.containers[0].image.as_deref(),
            Some("registry.local/runtime:2.5")
        );
    }

    #[tokio::test]
    async fn prelaunch_hook_runs_before_create() {
        let h = harness();
        let hook = Arc::new(RecordingHook::default());
        let request = request().with_prelaunch(hook.clone());

        h.controller
            .start(&identity(), &request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*hook.names.lock(), vec!["net1-peer1-mycc".to_string()]);
    }

    #[tokio::test]
    async fn prelaunch_failure_skips_create() {
        let h = harness();
        let hook = Arc::new(RecordingHook {
            refuse: true,
            ..Default::default()
        });
        let request = request().with_prelaunch(hook);

        let err = h
            .controller
            .start(&identity(), &request, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PrelaunchFailed);
        assert!(!h
            .orchestrator
            .calls()
            .iter()
            .any(|c| matches!(c, MockCall::Create { .. })));
    }

    #[tokio::test]
    async fn cancelled_start_makes_no_calls() {
        let h = harness();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h
            .controller
            .start(&identity(), &request(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ControllerError::Cancelled {
                operation: Operation::Start,
                ..
            }
        ));
        assert_eq!(h.factory.connect_count(), 0);
        assert!(h.orchestrator.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_unblocks_in_flight_create() {
        let h = harness();
        h.orchestrator.stall_creates(true);
        let cancel = CancellationToken::new();

        let identity = identity();
        let request = request();

        let (result, ()) = tokio::join!(
            h.controller.start(&identity, &request, &cancel),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            }
        );

        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(err.resolved_name(), Some("net1-peer1-mycc"));
        assert_eq!(
            h.observer.path("net1-peer1-mycc"),
            vec![(Absent, Creating), (Creating, Failed)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_unblocks_in_flight_stop() {
        let h = harness();
        h.orchestrator.insert("default", named("net1-peer1-mycc"));
        h.orchestrator.stall_deletes(true);
        let cancel = CancellationToken::new();

        let identity = identity();
        let options = StopOptions::default();

        let (result, ()) = tokio::join!(
            h.controller.stop(&identity, &options, &cancel),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            }
        );

        match result.unwrap_err() {
            ControllerError::Cancelled { operation, name } => {
                assert_eq!(operation, Operation::Stop);
                assert_eq!(name.as_deref(), Some("net1-peer1-mycc"));
            }
            other => panic!("expected Cancelled, got {other:?}"),
        }
        assert_eq!(
            h.observer.path("net1-peer1-mycc"),
            vec![(Running, Deleting), (Deleting, Failed)]
        );
        assert_eq!(h.orchestrator.deployment_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_unblocks_precreate_cleanup() {
        let h = harness();
        h.orchestrator.stall_deletes(true);
        let cancel = CancellationToken::new();

        let identity = identity();
        let request = request();

        let (result, ()) = tokio::join!(
            h.controller.start(&identity, &request, &cancel),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            }
        );

        let err = result.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Cancelled {
                operation: Operation::Start,
                ..
            }
        ));
        assert_eq!(err.resolved_name(), Some("net1-peer1-mycc"));
        assert!(!h
            .orchestrator
            .calls()
            .iter()
            .any(|c| matches!(c, MockCall::Create { .. })));
        assert!(h.observer.transitions().is_empty());
    }

    struct StallingHook;

    #[async_trait]
    impl crate::types::PrelaunchHook for StallingHook {
        async fn prelaunch(&self, _name: &str) -> std::result::Result<(), String> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_unblocks_stalled_prelaunch_hook() {
        let h = harness();
        let cancel = CancellationToken::new();

        let identity = identity();
        let request = request().with_prelaunch(Arc::new(StallingHook));

        let (result, ()) = tokio::join!(
            h.controller.start(&identity, &request, &cancel),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            }
        );

        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(err.resolved_name(), Some("net1-peer1-mycc"));
        assert_eq!(h.orchestrator.deployment_count(), 0);
        assert!(!h
            .orchestrator
            .calls()
            .iter()
            .any(|c| matches!(c, MockCall::Create { .. })));
        assert!(h.observer.transitions().is_empty());
    }

    #[tokio::test]
    async fn stop_deletes_with_foreground_cascade() {
        let h = harness();
        let cancel = CancellationToken::new();
        h.controller
            .start(&identity(), &request(), &cancel)
            .await
            .unwrap();

        h.controller
            .stop(
                &identity(),
                &StopOptions::with_timeout(Duration::from_secs(30)),
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(h.orchestrator.deployment_count(), 0);
        let last = h.orchestrator.calls().pop().unwrap();
        match last {
            MockCall::Delete { name, options, .. } => {
                assert_eq!(name, "net1-peer1-mycc");
                assert_eq!(options.propagation, PropagationPolicy::Foreground);
                assert_eq!(options.grace_period, Some(Duration::from_secs(30)));
            }
            other => panic!("expected delete, got {other:?}"),
        }
        assert_eq!(
            h.observer.path("net1-peer1-mycc")[2..],
            [(Running, Deleting), (Deleting, Absent)]
        );
    }

    #[tokio::test]
    async fn stop_never_started_is_typed_teardown_error() {
        let h = harness();

        let err = h
            .controller
            .stop(&identity(), &StopOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TeardownFailed);
        assert!(err.is_not_found());
        assert_eq!(err.http_status_code(), 404);
        assert_eq!(
            h.observer.path("net1-peer1-mycc"),
            vec![(Running, Deleting), (Deleting, Failed)]
        );
    }

    #[tokio::test]
    async fn stop_missing_can_be_tolerated() {
        let h = harness_with(ControllerConfig {
            tolerate_missing_on_stop: true,
            ..Default::default()
        });

        h.controller
            .stop(&identity(), &StopOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        // Other errors still surface.
        h.orchestrator.fail_deletes(Some(server_error()));
        let err = h
            .controller
            .stop(&identity(), &StopOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn stop_without_client_is_unavailable() {
        let h = harness();
        h.factory.set_unavailable(Some("connection refused"));

        let err = h
            .controller
            .stop(&identity(), &StopOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientUnavailable);
    }

    #[tokio::test]
    async fn destroy_and_deploy_are_noops() {
        let h = harness();

        h.controller
            .destroy(
                &identity(),
                &DestroyOptions {
                    force: true,
                    prune_images: true,
                },
            )
            .await
            .unwrap();
        h.controller
            .deploy(&identity(), &DeploymentSpec::builder_and_runtime())
            .await
            .unwrap();

        assert_eq!(h.factory.connect_count(), 0);
        assert!(h.orchestrator.calls().is_empty());
    }

    #[test]
    fn resolve_name_passes_transform_errors_through() {
        let h = harness();

        assert_eq!(
            h.controller.resolve_name(&identity(), None).unwrap(),
            "net1-peer1-mycc"
        );

        let failing = |s: &str| Err::<String, _>(FormatError::new(format!("{s}:bad"), "rejected"));
        let err = h
            .controller
            .resolve_name(&identity(), Some(&failing))
            .unwrap_err();
        match err {
            ControllerError::NameResolution(e) => assert_eq!(e.partial(), "net1-peer1-mycc:bad"),
            other => panic!("expected NameResolution, got {other:?}"),
        }
    }
}
