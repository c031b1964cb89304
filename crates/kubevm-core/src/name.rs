//! Orchestrator-safe name resolution.
//!
//! Resource names are derived from a [`WorkloadIdentity`] by joining the
//! non-empty parts with `-`, optionally passing the result through a caller
//! transform, and finally rewriting every character outside
//! `[A-Za-z0-9-_.]` to `-`. Sanitizing runs after the transform so the final
//! output always satisfies the naming grammar whatever the transform emits.

use thiserror::Error;

use crate::identity::WorkloadIdentity;

/// Error returned by a formatting transform.
///
/// `partial` is whatever the transform produced before failing. It is handed
/// back to the caller untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct FormatError {
    /// Output of the transform at the point of failure.
    pub partial: String,
    /// Why the transform failed.
    pub reason: String,
}

impl FormatError {
    /// Create a new format error.
    #[must_use]
    pub fn new(partial: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            partial: partial.into(),
            reason: reason.into(),
        }
    }
}

/// Errors that can occur when resolving a name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    /// The caller-supplied transform failed.
    #[error("format transform failed for {partial:?}: {reason}")]
    Format {
        /// Unsanitized transform output.
        partial: String,
        /// Reason reported by the transform.
        reason: String,
    },
}

impl NameError {
    /// The unsanitized name the failed transform returned.
    #[must_use]
    pub fn partial(&self) -> &str {
        match self {
            Self::Format { partial, .. } => partial,
        }
    }
}

impl From<FormatError> for NameError {
    fn from(err: FormatError) -> Self {
        Self::Format {
            partial: err.partial,
            reason: err.reason,
        }
    }
}

/// A formatting transform applied to the joined name before sanitizing.
pub type FormatFn<'a> = &'a (dyn Fn(&str) -> Result<String, FormatError> + Send + Sync);

/// Resolve the resource name for `identity`.
///
/// # Errors
///
/// Returns [`NameError::Format`] when `format` fails. The error carries the
/// transform's output exactly as returned; it is not sanitized.
pub fn resolve(
    identity: &WorkloadIdentity,
    format: Option<FormatFn<'_>>,
) -> Result<String, NameError> {
    let mut name = qualified(identity);

    if let Some(format) = format {
        name = format(&name)?;
    }

    Ok(sanitize(&name))
}

/// Join the non-empty identity parts with `-`.
#[must_use]
pub fn qualified(identity: &WorkloadIdentity) -> String {
    let WorkloadIdentity {
        network_id,
        peer_id,
        base_name,
    } = identity;

    match (network_id.is_empty(), peer_id.is_empty()) {
        (false, false) => format!("{network_id}-{peer_id}-{base_name}"),
        (false, true) => format!("{network_id}-{base_name}"),
        (true, false) => format!("{peer_id}-{base_name}"),
        (true, true) => base_name.clone(),
    }
}

/// Whether `c` belongs to the resource naming alphabet.
#[must_use]
pub const fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// Replace every character outside `[A-Za-z0-9-_.]` with `-`, one for one.
#[must_use]
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if is_name_char(c) { c } else { '-' })
        .collect()
}

/// Whether `name` is non-empty and entirely within the naming alphabet.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(is_name_char)
}

/// Normalize a resolved name for deletion.
///
/// Older identifiers used `name:version`; the delete path has always mapped
/// `:` to `_`.
#[must_use]
pub fn normalize_for_delete(name: &str) -> String {
    name.replace(':', "_")
}
