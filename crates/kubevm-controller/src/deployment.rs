//! Deployment builder for Kubernetes.
//!
//! This module turns a caller's [`DeploymentSpec`] into an `apps/v1`
//! Deployment named after the resolved workload name.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec as K8sDeploymentSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use kubevm_core::WorkloadIdentity;

use crate::types::{ContainerSpec, ControllerConfig, DeploymentSpec};

/// Label selecting the pods of one workload.
pub const WORKLOAD_LABEL: &str = "kubevm.io/workload";

/// Label marking resources created by this controller.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

const MANAGED_BY: &str = "kubevm";

/// Longest value Kubernetes accepts for a label.
const MAX_LABEL_VALUE: usize = 63;

/// Hash bytes appended to label values that had to be shortened.
const LABEL_HASH_BYTES: usize = 4;

/// Build the Deployment for a workload.
///
/// `name` is the already-resolved resource name. `env` is merged into every
/// main container on top of the container's own variables; init containers
/// only get their own.
#[must_use]
pub fn build_deployment(
    identity: &WorkloadIdentity,
    name: &str,
    spec: &DeploymentSpec,
    env: &BTreeMap<String, String>,
    config: &ControllerConfig,
) -> Deployment {
    let selector = selector_labels(name);

    let mut pod_labels = spec.labels.clone();
    pod_labels.extend(selector.clone());

    Deployment {
        metadata: build_metadata(identity, name, &selector, config),
        spec: Some(K8sDeploymentSpec {
            replicas: Some(spec.replicas.unwrap_or(config.default_replicas)),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(build_pod_spec(spec, env, config)),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Labels that select the pods of the workload `name`.
#[must_use]
pub fn selector_labels(name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(WORKLOAD_LABEL.to_string(), label_value(name));
    labels
}

/// Fit a resolved name into a label value.
///
/// Names that already are valid label values are used as is. Anything else
/// (too long, or starting or ending on punctuation) becomes an alphanumeric
/// prefix of the name followed by `-` and 8 hex digits of its blake3 hash,
/// so distinct names keep distinct selectors.
#[must_use]
pub fn label_value(name: &str) -> String {
    if is_label_value(name) {
        return name.to_string();
    }

    let hash = blake3::hash(name.as_bytes());
    let suffix = hex::encode(&hash.as_bytes()[..LABEL_HASH_BYTES]);

    let max_prefix = MAX_LABEL_VALUE - suffix.len() - 1;
    let trimmed = name.trim_start_matches(|c: char| !c.is_ascii_alphanumeric());
    let capped: String = trimmed.chars().take(max_prefix).collect();
    let prefix = capped.trim_end_matches(|c: char| !c.is_ascii_alphanumeric());

    if prefix.is_empty() {
        suffix
    } else {
        format!("{prefix}-{suffix}")
    }
}

fn is_label_value(value: &str) -> bool {
    let edges_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());

    value.len() <= MAX_LABEL_VALUE
        && edges_ok(value.chars().next())
        && edges_ok(value.chars().last())
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn build_metadata(
    identity: &WorkloadIdentity,
    name: &str,
    selector: &BTreeMap<String, String>,
    config: &ControllerConfig,
) -> ObjectMeta {
    let mut labels = selector.clone();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());

    let mut annotations = BTreeMap::new();
    annotations.insert(
        "kubevm.io/network-id".to_string(),
        identity.network_id.clone(),
    );
    annotations.insert("kubevm.io/peer-id".to_string(), identity.peer_id.clone());
    annotations.insert(
        "kubevm.io/base-name".to_string(),
        identity.base_name.clone(),
    );
    annotations.insert(
        "kubevm.io/created-at".to_string(),
        chrono::Utc::now().to_rfc3339(),
    );

    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(config.namespace.clone()),
        labels: Some(labels),
        annotations: Some(annotations),
        ..Default::default()
    }
}

fn build_pod_spec(
    spec: &DeploymentSpec,
    env: &BTreeMap<String, String>,
    config: &ControllerConfig,
) -> PodSpec {
    let no_extra_env = BTreeMap::new();

    let init_containers: Vec<Container> = spec
        .init_containers
        .iter()
        .map(|c| build_container(c, &config.builder_image, &no_extra_env))
        .collect();

    PodSpec {
        init_containers: (!init_containers.is_empty()).then_some(init_containers),
        containers: spec
            .containers
            .iter()
            .map(|c| build_container(c, &config.runtime_image, env))
            .collect(),
        ..Default::default()
    }
}

fn build_container(
    container: &ContainerSpec,
    default_image: &str,
    extra_env: &BTreeMap<String, String>,
) -> Container {
    let mut env = container.env.clone();
    env.extend(extra_env.iter().map(|(k, v)| (k.clone(), v.clone())));

    Container {
        name: container.name.clone(),
        image: Some(
            container
                .image
                .clone()
                .unwrap_or_else(|| default_image.to_string()),
        ),
        command: non_empty(&container.command),
        args: non_empty(&container.args),
        env: (!env.is_empty()).then(|| build_env_vars(&env)),
        ..Default::default()
    }
}

fn build_env_vars(env: &BTreeMap<String, String>) -> Vec<EnvVar> {
    env.iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect()
}

fn non_empty(items: &[String]) -> Option<Vec<String>> {
    (!items.is_empty()).then(|| items.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_identity() -> WorkloadIdentity {
        WorkloadIdentity::new("net1", "peer1", "mycc")
    }

    fn build(spec: &DeploymentSpec, env: &BTreeMap<String, String>) -> Deployment {
        build_deployment(
            &test_identity(),
            "net1-peer1-mycc",
            spec,
            env,
            &ControllerConfig::default(),
        )
    }

    #[test]
    fn build_deployment_has_required_fields() {
        let deployment = build(&DeploymentSpec::builder_and_runtime(), &BTreeMap::new());

        // Metadata
        let meta = &deployment.metadata;
        assert_eq!(meta.name.as_deref(), Some("net1-peer1-mycc"));
        assert_eq!(meta.namespace.as_deref(), Some("default"));

        let labels = meta.labels.as_ref().unwrap();
        assert_eq!(labels.get(WORKLOAD_LABEL).unwrap(), "net1-peer1-mycc");
        assert_eq!(labels.get(MANAGED_BY_LABEL).unwrap(), "kubevm");

        let annotations = meta.annotations.as_ref().unwrap();
        assert_eq!(annotations.get("kubevm.io/network-id").unwrap(), "net1");
        assert_eq!(annotations.get("kubevm.io/peer-id").unwrap(), "peer1");
        assert_eq!(annotations.get("kubevm.io/base-name").unwrap(), "mycc");
        assert!(annotations.contains_key("kubevm.io/created-at"));

        // Spec
        let spec = deployment.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(
            spec.selector.match_labels.as_ref().unwrap(),
            &selector_labels("net1-peer1-mycc")
        );

        // Pod template
        let template_labels = spec.template.metadata.as_ref().unwrap().labels.as_ref().unwrap();
        assert_eq!(
            template_labels.get(WORKLOAD_LABEL).unwrap(),
            "net1-peer1-mycc"
        );

        let pod_spec = spec.template.spec.as_ref().unwrap();
        let init = pod_spec.init_containers.as_ref().unwrap();
        assert_eq!(init[0].name, "builder");
        assert_eq!(
            init[0].image.as_deref(),
            Some("hyperledger/fabric-ccenv:latest")
        );
        assert_eq!(pod_spec.containers[0].name, "runtime");
        assert_eq!(
            pod_spec.containers[0].image.as_deref(),
            Some("hyperledger/fabric-baseos:latest")
        );
    }

    #[test]
    fn build_deployment_uses_spec_values() {
        let spec = DeploymentSpec {
            replicas: Some(3),
            containers: vec![ContainerSpec::new("peer-cc")
                .with_image("registry.local/cc:2.0")
                .with_args(["chaincode", "-peer.address=peer0:7052"])
                .with_env("CORE_CHAINCODE_LOGGING_LEVEL", "info")],
            ..Default::default()
        }
        .with_label("tier", "chaincode");

        let deployment = build(&spec, &BTreeMap::new());
        let k8s_spec = deployment.spec.as_ref().unwrap();
        assert_eq!(k8s_spec.replicas, Some(3));

        let template_labels = k8s_spec
            .template
            .metadata
            .as_ref()
            .unwrap()
            .labels
            .as_ref()
            .unwrap();
        assert_eq!(template_labels.get("tier").unwrap(), "chaincode");

        let pod_spec = k8s_spec.template.spec.as_ref().unwrap();
        assert!(pod_spec.init_containers.is_none());

        let container = &pod_spec.containers[0];
        assert_eq!(container.image.as_deref(), Some("registry.local/cc:2.0"));
        assert!(container.command.is_none());
        assert_eq!(
            container.args.as_deref().unwrap(),
            ["chaincode", "-peer.address=peer0:7052"]
        );
    }

    #[test]
    fn request_env_overrides_main_containers_only() {
        let spec = DeploymentSpec {
            init_containers: vec![ContainerSpec::new("builder").with_env("GOPATH", "/go")],
            containers: vec![ContainerSpec::new("runtime").with_env("CORE_PEER_ID", "old")],
            ..Default::default()
        };
        let env: BTreeMap<String, String> = [
            ("CORE_PEER_ID".to_string(), "peer1".to_string()),
            ("CORE_CHAINCODE_ID_NAME".to_string(), "mycc:1.0".to_string()),
        ]
        .into_iter()
        .collect();

        let deployment = build(&spec, &env);
        let pod_spec = deployment.spec.unwrap().template.spec.unwrap();

        let init_env = pod_spec.init_containers.unwrap()[0].env.clone().unwrap();
        assert_eq!(init_env.len(), 1);
        assert_eq!(init_env[0].name, "GOPATH");

        let main_env = pod_spec.containers[0].env.clone().unwrap();
        let pairs: Vec<_> = main_env
            .iter()
            .map(|e| (e.name.as_str(), e.value.as_deref().unwrap()))
            .collect();
        assert_eq!(
            pairs,
            [
                ("CORE_CHAINCODE_ID_NAME", "mycc:1.0"),
                ("CORE_PEER_ID", "peer1")
            ]
        );
    }

    #[test]
    fn label_value_keeps_valid_names() {
        assert_eq!(label_value("net1-peer1-mycc"), "net1-peer1-mycc");
        assert_eq!(label_value("peer0.org1_mycc-1.0"), "peer0.org1_mycc-1.0");
        assert_eq!(label_value(&"a".repeat(63)), "a".repeat(63));
    }

    #[test]
    fn label_value_fits_label_rules() {
        let long = format!("{}-{}", "a".repeat(62), "b".repeat(10));
        for name in ["-my-cc-", "my-cc-", "...", "", long.as_str()] {
            let value = label_value(name);
            assert!(value.len() <= MAX_LABEL_VALUE, "{name:?} -> {value:?}");
            assert!(is_label_value(&value), "{name:?} -> {value:?}");
        }

        let value = label_value("my-cc-");
        assert!(value.starts_with("my-cc-"));
        assert_eq!(value.len(), "my-cc-".len() + 8);
    }

    #[test]
    fn distinct_names_get_distinct_selectors() {
        let sanitized = WorkloadIdentity::new("", "", "my cc!").resolve_name();
        let plain = WorkloadIdentity::new("", "", "my-cc").resolve_name();
        assert_eq!(sanitized, "my-cc-");
        assert_ne!(selector_labels(&sanitized), selector_labels(&plain));

        let prefix = "x".repeat(63);
        let long_a = format!("{prefix}-a");
        let long_b = format!("{prefix}-b");
        assert_ne!(selector_labels(&long_a), selector_labels(&long_b));
        assert_ne!(label_value(&prefix), label_value(&long_a));

        assert_ne!(label_value("."), label_value(".."));
    }

    #[test]
    fn label_value_is_stable() {
        let name = "-my-cc-";
        assert_eq!(label_value(name), label_value(name));
    }
}
