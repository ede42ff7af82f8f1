//! # Foreign Framework Interfaces
//!
//! What a shim needs from the framework it wraps, split three ways:
//!
//! - [`Framework`]: tensors, autograd, conversion to and from [`Array`],
//!   gradient clipping, and the framework's own state serializer
//! - [`ForeignModel`]: one model object (call, modes, parameters, state
//!   dicts, placement) and how to build an optimizer over its parameters
//! - [`ForeignOptimizer`]: an optimizer whose hyperparameters can be changed
//!   in place without losing its per-parameter state
//!
//! A shim never looks inside a tensor. Everything it does with one goes
//! through these traits.

use graft_core::{Array, ArgsKwargs, Device, Value};

use crate::optim::UpdateRule;

/// Named tensors in a model's canonical parameter order.
pub type NamedTensors<T> = Vec<(String, T)>;

pub type TensorOf<M> = <<M as ForeignModel>::Framework as Framework>::Tensor;
pub type ErrorOf<M> = <<M as ForeignModel>::Framework as Framework>::Error;

/// Tensor, autograd and serialization entry points of a framework.
pub trait Framework: 'static {
    /// Used in error messages and logs.
    const NAME: &'static str;

    type Tensor: 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Another handle to the same storage.
    fn share(tensor: &Self::Tensor) -> Self::Tensor;

    /// Run `f` with gradient tracking off.
    fn no_grad<R>(f: impl FnOnce() -> R) -> R;

    /// Reverse pass from `outputs`, seeded with `grads` (same length).
    fn backward(outputs: &[Self::Tensor], grads: &[Self::Tensor]) -> Result<(), Self::Error>;

    /// Gradient accumulated into `tensor`, if any.
    fn grad(tensor: &Self::Tensor) -> Option<Self::Tensor>;

    fn device(tensor: &Self::Tensor) -> Device;

    fn to_array(tensor: &Self::Tensor) -> Result<Array, Self::Error>;

    fn from_array(array: &Array, device: Device, requires_grad: bool) -> Result<Self::Tensor, Self::Error>;

    /// Scale gradients so their global L2 norm is at most `max_norm`.
    fn clip_grad_norm(params: &[Self::Tensor], max_norm: f32) -> Result<f32, Self::Error>;

    fn save_state(state: &NamedTensors<Self::Tensor>) -> Result<Vec<u8>, Self::Error>;

    fn load_state(bytes: &[u8], map_location: Device) -> Result<NamedTensors<Self::Tensor>, Self::Error>;

    /// The accelerator new work lands on.
    fn current_accelerator() -> Result<Device, Self::Error>;
}

/// A model object owned by a foreign framework.
pub trait ForeignModel: 'static {
    type Framework: Framework;
    type Optimizer: ForeignOptimizer<Error = ErrorOf<Self>>;

    fn forward(&mut self, inputs: &ArgsKwargs<TensorOf<Self>>) -> Result<Value<TensorOf<Self>>, ErrorOf<Self>>;

    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    fn device(&self) -> Device;

    /// Handles to the live parameters.
    fn parameters(&self) -> Result<Vec<TensorOf<Self>>, ErrorOf<Self>>;

    /// Detached copies of every named parameter.
    fn state_dict(&self) -> Result<NamedTensors<TensorOf<Self>>, ErrorOf<Self>>;

    /// Copy `state` into the parameters. `strict` requires every parameter
    /// to be present. Nothing is written if validation fails.
    fn load_state_dict(&mut self, state: &NamedTensors<TensorOf<Self>>, strict: bool) -> Result<(), ErrorOf<Self>>;

    fn to_device(&mut self, device: Device) -> Result<(), ErrorOf<Self>>;

    /// Bind a new optimizer to every parameter.
    fn build_optimizer(&self, rule: &UpdateRule) -> Result<Self::Optimizer, ErrorOf<Self>>;
}

pub trait ForeignOptimizer {
    type Error;

    /// Family of the rule the optimizer was built with.
    fn family(&self) -> &'static str;

    /// Overwrite hyperparameters in every parameter group.
    fn update_groups(&mut self, rule: &UpdateRule) -> Result<(), Self::Error>;

    fn step(&mut self) -> Result<(), Self::Error>;

    fn zero_grad(&mut self) -> Result<(), Self::Error>;
}
