//! Workload identity type for kubevm.
//!
//! A [`WorkloadIdentity`] is the logical key of a deployable unit. It carries
//! no semantics beyond naming: the orchestrator resource for a workload is
//! always found again by resolving the same identity.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, Result};
use crate::name;

/// The `(network id, peer id, base name)` tuple identifying a workload.
///
/// Either id may be empty; the base name is normally set but the type does
/// not enforce it.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadIdentity {
    /// Network the owning peer belongs to.
    #[serde(default)]
    pub network_id: String,
    /// Peer that owns the workload.
    #[serde(default)]
    pub peer_id: String,
    /// Base name of the workload itself.
    pub base_name: String,
}

impl WorkloadIdentity {
    /// Create a new identity.
    #[must_use]
    pub fn new(
        network_id: impl Into<String>,
        peer_id: impl Into<String>,
        base_name: impl Into<String>,
    ) -> Self {
        Self {
            network_id: network_id.into(),
            peer_id: peer_id.into(),
            base_name: base_name.into(),
        }
    }

    /// Create an identity with only a base name.
    #[must_use]
    pub fn named(base_name: impl Into<String>) -> Self {
        Self::new("", "", base_name)
    }

    /// Resolve the orchestrator resource name without a formatting transform.
    #[must_use]
    pub fn resolve_name(&self) -> String {
        name::sanitize(&name::qualified(self))
    }

    /// Resolve the resource name, rejecting identities that resolve to nothing.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EmptyName`] when the network id, peer id and base
    /// name are all empty.
    pub fn require_name(&self) -> Result<String> {
        let resolved = self.resolve_name();
        if resolved.is_empty() {
            return Err(CoreError::EmptyName(self.clone()));
        }
        Ok(resolved)
    }
}

impl fmt::Debug for WorkloadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkloadIdentity({self})")
    }
}

impl fmt::Display for WorkloadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.network_id, self.peer_id, self.base_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_keeps_empty_segments() {
        let id = WorkloadIdentity::named("mycc");
        assert_eq!(id.to_string(), "//mycc");
        assert_eq!(format!("{id:?}"), "WorkloadIdentity(//mycc)");
    }

    #[test]
    fn require_name_rejects_empty_identity() {
        let id = WorkloadIdentity::new("", "", "");
        assert!(matches!(id.require_name(), Err(CoreError::EmptyName(_))));
    }

    #[test]
    fn require_name_accepts_peer_only() {
        let id = WorkloadIdentity::new("", "peer0", "");
        assert_eq!(id.require_name().unwrap(), "peer0-");
    }

    #[test]
    fn serde_defaults_missing_ids() {
        let id: WorkloadIdentity = serde_json::from_str(r#"{"base_name":"mycc"}"#).unwrap();
        assert_eq!(id, WorkloadIdentity::named("mycc"));
    }

    #[test]
    fn serde_json_roundtrip() {
        let id = WorkloadIdentity::new("dev", "peer0.org1", "mycc-1.0");
        let json = serde_json::to_string(&id).unwrap();
        let parsed: WorkloadIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }
}
