//! # Layers
//!
//! The calling convention every graft layer follows: a forward call returns
//! its outputs together with a callback that maps output gradients to input
//! gradients. Parameter gradients stay inside the layer until the orchestrator
//! calls [`Layer::finish_update`].

use crate::optimizer::Optimizer;

/// Maps gradients of a layer's outputs to gradients of its inputs.
///
/// Runs at most once; a layer that cannot backpropagate (inference mode)
/// returns a callback that does nothing.
pub type Backprop<In, Out, E> = Box<dyn FnOnce(Out) -> Result<In, E>>;

/// A differentiable layer.
pub trait Layer {
    type Input;
    type Output;
    type Error: std::error::Error + 'static;

    /// Run the layer. With `is_train == false` the returned backprop is a no-op.
    #[allow(clippy::type_complexity)]
    fn call(
        &mut self,
        inputs: Self::Input,
        is_train: bool,
    ) -> Result<(Self::Output, Backprop<Self::Input, Self::Output, Self::Error>), Self::Error>;

    /// Inference-only forward pass.
    fn predict(&mut self, inputs: Self::Input) -> Result<Self::Output, Self::Error> {
        self.call(inputs, false).map(|(outputs, _)| outputs)
    }

    /// Apply the gradients accumulated since the last call.
    fn finish_update(&mut self, optimizer: &mut Optimizer) -> Result<(), Self::Error>;
}
