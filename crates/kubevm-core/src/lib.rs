//! Core types and utilities for kubevm.
//!
//! This crate provides the foundational types used by the lifecycle controller:
//!
//! - **Identities**: the [`WorkloadIdentity`] tuple that logically names a workload
//! - **Name resolution**: deterministic translation of an identity into a
//!   resource name the orchestrator accepts
//! - **Error types**: Common error definitions shared across crates
//!
//! # Example
//!
//! ```
//! use kubevm_core::{name, WorkloadIdentity};
//!
//! let identity = WorkloadIdentity::new("net1", "peer1", "mycc");
//! assert_eq!(name::resolve(&identity, None).unwrap(), "net1-peer1-mycc");
//!
//! let odd = WorkloadIdentity::new("", "", "my cc!");
//! assert_eq!(odd.resolve_name(), "my-cc-");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod identity;
pub mod name;

pub use error::{CoreError, Result};
pub use identity::WorkloadIdentity;
pub use name::{FormatError, NameError};
