//! Error types for the controller crate.

use kubevm_core::{CoreError, NameError};
use thiserror::Error;

use crate::client::RemoteError;
use crate::types::Operation;

/// Broad classification of controller failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The orchestrator client could not be constructed.
    ClientUnavailable,
    /// A formatting transform failed.
    NameResolutionFailed,
    /// The request or configuration was rejected before any remote call.
    Invalid,
    /// The create call failed.
    DeployFailed,
    /// The delete call failed.
    TeardownFailed,
    /// The prelaunch hook failed.
    PrelaunchFailed,
    /// The caller cancelled the operation.
    Cancelled,
}

/// Errors that can occur during lifecycle operations.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// No usable orchestrator client: bad credentials, unreachable endpoint,
    /// or no configuration source.
    #[error("orchestrator client unavailable: {0}")]
    ClientUnavailable(String),

    /// A caller-supplied formatting transform failed.
    #[error(transparent)]
    NameResolution(#[from] NameError),

    /// The workload description is unusable.
    #[error("invalid workload spec: {0}")]
    InvalidSpec(String),

    /// The orchestrator rejected or failed the create call.
    #[error("failed to create deployment {namespace}/{name}: {source}")]
    DeployFailed {
        /// Resolved deployment name.
        name: String,
        /// Target namespace.
        namespace: String,
        /// Remote failure.
        #[source]
        source: RemoteError,
    },

    /// The orchestrator rejected or failed the delete call.
    #[error("failed to delete deployment {namespace}/{name}: {source}")]
    TeardownFailed {
        /// Resolved deployment name.
        name: String,
        /// Target namespace.
        namespace: String,
        /// Remote failure.
        #[source]
        source: RemoteError,
    },

    /// The prelaunch hook refused the launch.
    #[error("prelaunch failed for {name}: {reason}")]
    PrelaunchFailed {
        /// Resolved deployment name.
        name: String,
        /// Reason reported by the hook.
        reason: String,
    },

    /// The operation was cancelled by the caller.
    #[error("{operation} cancelled{}", name_suffix(.name))]
    Cancelled {
        /// Operation that was interrupted.
        operation: Operation,
        /// Resolved name, if it was known at the time.
        name: Option<String>,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<CoreError> for ControllerError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::EmptyName(_) => Self::InvalidSpec(err.to_string()),
        }
    }
}

impl ControllerError {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ClientUnavailable(_) => ErrorKind::ClientUnavailable,
            Self::NameResolution(_) => ErrorKind::NameResolutionFailed,
            Self::InvalidSpec(_) | Self::Config(_) => ErrorKind::Invalid,
            Self::DeployFailed { .. } => ErrorKind::DeployFailed,
            Self::TeardownFailed { .. } => ErrorKind::TeardownFailed,
            Self::PrelaunchFailed { .. } => ErrorKind::PrelaunchFailed,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// The resolved name this error concerns, when known.
    #[must_use]
    pub fn resolved_name(&self) -> Option<&str> {
        match self {
            Self::DeployFailed { name, .. }
            | Self::TeardownFailed { name, .. }
            | Self::PrelaunchFailed { name, .. } => Some(name),
            Self::Cancelled { name, .. } => name.as_deref(),
            Self::ClientUnavailable(_)
            | Self::NameResolution(_)
            | Self::InvalidSpec(_)
            | Self::Config(_) => None,
        }
    }

    /// The remote failure behind this error, if any.
    #[must_use]
    pub const fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::DeployFailed { source, .. } | Self::TeardownFailed { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }

    /// Whether the orchestrator reported the resource as missing.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.remote().is_some_and(RemoteError::is_not_found)
    }

    /// Check if this error is retriable.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ClientUnavailable(_) => true,
            Self::DeployFailed { source, .. } | Self::TeardownFailed { source, .. } => {
                source.is_transient()
            }
            _ => false,
        }
    }

    /// Get the HTTP status code for this error.
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::NameResolution(_) | Self::InvalidSpec(_) | Self::Config(_) => 400,
            Self::DeployFailed {
                source: RemoteError::AlreadyExists(_),
                ..
            } => 409,
            Self::TeardownFailed {
                source: RemoteError::NotFound(_),
                ..
            } => 404,
            Self::DeployFailed { .. } | Self::TeardownFailed { .. } => 502,
            Self::PrelaunchFailed { .. } => 500,
            Self::Cancelled { .. } => 408,
            Self::ClientUnavailable(_) => 503,
        }
    }
}

#[allow(clippy::ref_option)]
fn name_suffix(name: &Option<String>) -> String {
    name.as_deref().map(|n| format!(" for {n}")).unwrap_or_default()
}

/// A specialized Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;
