//! Error kinds raised by graph construction, realization and backward passes.

use thiserror::Error;

/// Errors produced while building, realizing or differentiating a graph.
///
/// Errors are raised at the point of detection and never recovered
/// internally; the caller decides whether to abort or skip.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AutogradError {
    /// Operand shapes are incompatible with an operator's forward or backward contract.
    #[error("shape mismatch in `{op}`: {detail}")]
    ShapeMismatch {
        /// Operator (or array routine) that rejected its operands.
        op: &'static str,
        /// Human readable description of the offending shapes.
        detail: String,
    },

    /// The operator has no gradient rule.
    #[error("operator `{0}` has no gradient rule")]
    NotImplemented(&'static str),

    /// A node's value can never be derived, e.g. a malformed graph.
    #[error("node {id} has no derivable value: {reason}")]
    UnrealizedValue {
        /// Identity of the node that could not be realized.
        id: usize,
        /// Why the value is missing.
        reason: String,
    },
}

impl AutogradError {
    /// Shorthand for [`AutogradError::ShapeMismatch`].
    pub fn shape(op: &'static str, detail: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            op,
            detail: detail.into(),
        }
    }

    /// Whether this is a [`AutogradError::ShapeMismatch`].
    #[must_use]
    pub const fn is_shape_mismatch(&self) -> bool {
        matches!(self, Self::ShapeMismatch { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = AutogradError> = core::result::Result<T, E>;
