//! # Error Types
//!
//! Errors on the orchestrator side are composition failures: a payload or an
//! array that does not line up with what the receiving layer expects.

use thiserror::Error;

/// Core errors for graft models.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    /// Array shapes don't match at an elementwise or matmul boundary.
    #[error("Shape mismatch in {op}: {left:?} vs {right:?}")]
    ShapeMismatch {
        op: &'static str,
        left: Vec<usize>,
        right: Vec<usize>,
    },

    /// Data length doesn't agree with the declared shape.
    #[error("Data length {len} doesn't match shape {shape:?}")]
    DataLength { len: usize, shape: Vec<usize> },

    /// Two payloads that should mirror each other don't.
    #[error("Payload structure mismatch: {reason}")]
    StructureMismatch { reason: String },

    /// A payload carried a value of the wrong kind.
    #[error("Expected {expected}, got {got}")]
    UnexpectedValue {
        expected: &'static str,
        got: &'static str,
    },

    /// An optimizer config could not be parsed.
    #[error("Invalid optimizer config: {reason}")]
    InvalidConfig { reason: String },

    /// A device string could not be parsed.
    #[error("Invalid device `{0}` (expected \"cpu\" or an accelerator index)")]
    InvalidDevice(String),
}

impl CoreError {
    pub fn structure(reason: impl Into<String>) -> Self {
        CoreError::StructureMismatch {
            reason: reason.into(),
        }
    }
}
