//! Workload lifecycle state machine.
//!
//! The controller keeps no state of its own; the orchestrator is the only
//! authority. States are inferred from the outcome of each remote call and
//! reported to a [`LifecycleObserver`] as they happen.
//!
//! # State Machine
//!
//! ```text
//!     ┌──────────┐   create    ┌──────────┐  created  ┌──────────┐
//!     │  Absent  │────────────▶│ Creating │──────────▶│ Running  │
//!     └──────────┘             └────┬─────┘           └────┬─────┘
//!          ▲                        │ error                │ delete
//!          │                        ▼                      ▼
//!          │                   ┌──────────┐  error   ┌──────────┐
//!          │                   │  Failed  │◀─────────│ Deleting │
//!          │                   └──────────┘          └────┬─────┘
//!          │                                              │ deleted
//!          └──────────────────────────────────────────────┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::types::Operation;

/// Inferred state of a workload on the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadState {
    /// No deployment exists.
    Absent,
    /// The create call is in flight.
    Creating,
    /// The orchestrator accepted the deployment.
    Running,
    /// The delete call is in flight.
    Deleting,
    /// The last create or delete failed.
    Failed,
}

impl fmt::Display for WorkloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Absent => "absent",
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Deleting => "deleting",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Check if a state transition is valid according to the state machine.
#[must_use]
pub const fn is_valid_transition(from: WorkloadState, to: WorkloadState) -> bool {
    use WorkloadState::{Absent, Creating, Deleting, Failed, Running};

    matches!(
        (from, to),
        // Start
        (Absent | Failed, Creating)
            | (Creating, Running)
            // Stop
            | (Running | Failed, Deleting)
            | (Deleting, Absent)
            // Remote errors
            | (Creating | Deleting, Failed)
            // A failed workload may simply be gone
            | (Failed, Absent)
    )
}

/// Returns the list of valid target states from the given state.
#[must_use]
pub fn valid_transitions_from(state: WorkloadState) -> Vec<WorkloadState> {
    use WorkloadState::{Absent, Creating, Deleting, Failed, Running};

    match state {
        Absent => vec![Creating],
        Creating => vec![Running, Failed],
        Running => vec![Deleting],
        Deleting => vec![Absent, Failed],
        Failed => vec![Creating, Deleting, Absent],
    }
}

/// A transition the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid workload transition from {from} to {to}")]
pub struct InvalidTransition {
    /// Current state.
    pub from: WorkloadState,
    /// Requested state.
    pub to: WorkloadState,
}

/// Validate a state transition.
///
/// # Errors
///
/// Returns [`InvalidTransition`] if `from → to` is not allowed.
pub const fn validate_transition(
    from: WorkloadState,
    to: WorkloadState,
) -> Result<(), InvalidTransition> {
    if is_valid_transition(from, to) {
        Ok(())
    } else {
        Err(InvalidTransition { from, to })
    }
}

/// A state change of one workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Operation that caused it.
    pub operation: Operation,
    /// Resolved workload name.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Previous state.
    pub from: WorkloadState,
    /// New state.
    pub to: WorkloadState,
    /// Error text when entering `Failed`.
    pub message: Option<String>,
}

impl Transition {
    /// Whether `from → to` is allowed by the state machine.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        is_valid_transition(self.from, self.to)
    }
}

/// Receives lifecycle transitions. Injected into the controller in place of
/// a global logger.
pub trait LifecycleObserver: Send + Sync {
    /// Called once per transition, in order.
    fn on_transition(&self, transition: &Transition);
}

/// Logs transitions through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl LifecycleObserver for TracingObserver {
    fn on_transition(&self, t: &Transition) {
        if let Err(e) = validate_transition(t.from, t.to) {
            warn!(name = %t.name, error = %e, "Unexpected workload state transition");
        }

        if t.to == WorkloadState::Failed {
            warn!(
                operation = %t.operation,
                name = %t.name,
                namespace = %t.namespace,
                from = %t.from,
                message = ?t.message,
                "Workload operation failed"
            );
        } else {
            info!(
                operation = %t.operation,
                name = %t.name,
                namespace = %t.namespace,
                from = %t.from,
                to = %t.to,
                "Workload state changed"
            );
        }
    }
}

/// Observer doubles for testing.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;

    /// Records every transition it sees.
    #[derive(Debug, Default)]
    pub struct RecordingObserver {
        transitions: Mutex<Vec<Transition>>,
    }

    impl RecordingObserver {
        /// Create an empty recorder.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// All recorded transitions.
        #[must_use]
        pub fn transitions(&self) -> Vec<Transition> {
            self.transitions.lock().clone()
        }

        /// The `(from, to)` pairs recorded for `name`.
        #[must_use]
        pub fn path(&self, name: &str) -> Vec<(WorkloadState, WorkloadState)> {
            self.transitions
                .lock()
                .iter()
                .filter(|t| t.name == name)
                .map(|t| (t.from, t.to))
                .collect()
        }
    }

    impl LifecycleObserver for RecordingObserver {
        fn on_transition(&self, transition: &Transition) {
            self.transitions.lock().push(transition.clone());
        }
    }
}
