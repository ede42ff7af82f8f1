//! Error types for the autodiff framework.

use thiserror::Error;

use crate::device::Device;

/// Errors raised by tensor operations, autograd, optimizers and serialization.
#[derive(Debug, Error)]
pub enum DiffError {
    /// Operand shapes are incompatible.
    #[error("Shape mismatch in {op}: {left:?} vs {right:?}")]
    ShapeMismatch {
        op: &'static str,
        left: Vec<usize>,
        right: Vec<usize>,
    },

    /// Operands live on different devices.
    #[error("Expected all tensors to be on the same device, found {left} and {right}")]
    DeviceMismatch { left: Device, right: Device },

    /// The requested device does not exist.
    #[error("Device {device} is not available ({visible} accelerators visible)")]
    DeviceUnavailable { device: Device, visible: usize },

    /// `backward` was called on a tensor with no path to any leaf.
    #[error("Output {index} does not require grad and has no grad_fn")]
    NoGradFn { index: usize },

    /// `backward` got a different number of outputs and seed gradients.
    #[error("Got {outputs} outputs but {grads} seed gradients")]
    GradCount { outputs: usize, grads: usize },

    /// A state dict named a parameter the module doesn't have.
    #[error("Unexpected key in state dict: {0}")]
    UnexpectedKey(String),

    /// A strict state dict load is missing a parameter.
    #[error("Missing key in state dict: {0}")]
    MissingKey(String),

    /// A NaN or infinity showed up where a finite value is required.
    #[error("Non-finite values in {context}")]
    NonFinite { context: String },

    /// A serialized state blob is malformed.
    #[error("Invalid state format: {0}")]
    Format(String),

    #[error("State index encoding failed: {0}")]
    Bincode(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, DiffError>;
