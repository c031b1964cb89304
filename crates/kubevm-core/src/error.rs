//! Common error types for kubevm.
//!
//! This module provides shared error types that are used across multiple crates.

use crate::identity::WorkloadIdentity;
use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur throughout the kubevm system.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The identity resolves to an empty resource name.
    #[error("workload identity {0} resolves to an empty name")]
    EmptyName(WorkloadIdentity),
}
