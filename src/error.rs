//! Error types for comprobar
//!
//! Three classes of failure are distinguished:
//! - configuration errors (rejected before any tensor is built)
//! - shape/dtype errors (raised by the tensor layer, never translated)
//! - numerical mismatches (raised by the comparison harness)

use thiserror::Error;

use crate::compare::MismatchReport;
use crate::dtype::DType;

/// Result type alias for comprobar operations
pub type Result<T> = std::result::Result<T, ComprobarError>;

/// Error type for all comprobar operations
#[derive(Debug, Error)]
pub enum ComprobarError {
    /// Shape is malformed (empty, zero-sized dimension, bad permutation)
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// Why the shape was rejected
        reason: String,
    },

    /// Data length does not match the element count implied by the shape
    #[error("Data size {data_size} doesn't match shape {shape:?} (expected {expected})")]
    DataShapeMismatch {
        /// Number of elements provided
        data_size: usize,
        /// Requested shape
        shape: Vec<usize>,
        /// Element count implied by the shape
        expected: usize,
    },

    /// Two operands have incompatible shapes
    #[error("Shape mismatch in {op}: {left:?} vs {right:?}")]
    ShapeMismatch {
        /// Operation that failed
        op: &'static str,
        /// Left operand shape
        left: Vec<usize>,
        /// Right operand shape
        right: Vec<usize>,
    },

    /// Attention mask dtype is not one of float64, int64 or bool
    #[error("'attn_mask_type' should be 'int64', 'float64' or 'bool', got '{0}'")]
    UnsupportedMaskDtype(DType),

    /// Scenario or transformer configuration is inconsistent
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with the configuration
        reason: String,
    },

    /// Operation is not supported for the given arguments
    #[error("Unsupported operation: {operation} ({reason})")]
    UnsupportedOperation {
        /// Operation name
        operation: String,
        /// Why it is not supported
        reason: String,
    },

    /// Element-wise comparison failed
    #[error("{0}")]
    Mismatch(Box<MismatchReport>),

    /// Reading a scenario file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parsing a scenario file failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ComprobarError {
    /// Shorthand for [`ComprobarError::InvalidShape`]
    pub(crate) fn invalid_shape(reason: impl Into<String>) -> Self {
        Self::InvalidShape {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`ComprobarError::InvalidConfig`]
    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Whether this error came from a failed numerical comparison
    #[must_use]
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Self::Mismatch(_))
    }
}
