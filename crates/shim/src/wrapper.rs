//! # ShimLayer
//!
//! A [`Shim`] speaks the foreign framework's tensors. [`ShimLayer`] puts a
//! native face on it: `Array` in, `Array` out, and `Array` gradients both
//! ways, so a wrapped model can sit in a training loop next to native layers.
//!
//! ```text
//! X  ──from_array──► tensor ──shim──► tensor ──to_array──► Y
//! dX ◄──to_array──── grad ◄─backprop─ tensor ◄─from_array── dY
//! ```

use std::collections::HashMap;

use graft_core::{ArgsKwargs, Array, Backprop, Layer, Optimizer, ParamKey, Value};

use crate::error::ShimError;
use crate::framework::{ForeignModel, Framework};
use crate::shim::{with_params, Shim};

/// Native layer over a single-input, single-output foreign model.
pub struct ShimLayer<M: ForeignModel> {
    shim: Shim<M>,
}

impl<M: ForeignModel> ShimLayer<M> {
    pub fn new(shim: Shim<M>) -> Self {
        Self { shim }
    }

    pub fn shim(&self) -> &Shim<M> {
        &self.shim
    }

    pub fn shim_mut(&mut self) -> &mut Shim<M> {
        &mut self.shim
    }

    pub fn into_inner(self) -> Shim<M> {
        self.shim
    }

    /// Run `work` with parameters from `params`, usually `optimizer.averages`.
    pub fn use_params<R>(
        &mut self,
        params: &HashMap<ParamKey, Array>,
        work: impl FnOnce(&mut Self) -> R,
    ) -> Result<R, ShimError> {
        with_params::<Self, M, R>(self, params, work)
    }
}

impl<M: ForeignModel> AsMut<Shim<M>> for ShimLayer<M> {
    fn as_mut(&mut self) -> &mut Shim<M> {
        &mut self.shim
    }
}

fn to_array<M: ForeignModel>(
    value: Value<<M::Framework as Framework>::Tensor>,
    what: &'static str,
) -> Result<Option<Array>, ShimError> {
    match value {
        Value::Tensor(t) => <M::Framework as Framework>::to_array(&t)
            .map(Some)
            .map_err(|e| ShimError::framework(<M::Framework as Framework>::NAME, e)),
        Value::None => Ok(None),
        other => Err(ShimError::Core(graft_core::CoreError::UnexpectedValue {
            expected: what,
            got: other.kind(),
        })),
    }
}

impl<M: ForeignModel> Layer for ShimLayer<M> {
    type Input = Array;
    type Output = Array;
    type Error = ShimError;

    fn call(
        &mut self,
        inputs: Array,
        is_train: bool,
    ) -> Result<(Array, Backprop<Array, Array, ShimError>), ShimError> {
        let device = self.shim.model().device();
        let name = <M::Framework as Framework>::NAME;
        let x = <M::Framework as Framework>::from_array(&inputs, device, is_train)
            .map_err(|e| ShimError::framework(name, e))?;
        let (output, backprop) = self.shim.call(ArgsKwargs::from_tensors([x]), is_train)?;
        let y = to_array::<M>(output, "tensor output")?.ok_or_else(|| {
            ShimError::Core(graft_core::CoreError::UnexpectedValue {
                expected: "tensor output",
                got: "none",
            })
        })?;

        let input_shape = inputs.shape;
        let backprop: Backprop<Array, Array, ShimError> = Box::new(move |dy: Array| {
            let seed = <M::Framework as Framework>::from_array(&dy, device, false)
                .map_err(|e| ShimError::framework(name, e))?;
            let mut grads = backprop(ArgsKwargs::from_tensors([seed]))?;
            let dx = match grads.args.pop() {
                Some(value) => to_array::<M>(value, "input gradient")?,
                None => None,
            };
            // No gradient reached the input: it didn't affect the output.
            Ok(dx.unwrap_or_else(|| Array::zeros(input_shape)))
        });
        Ok((y, backprop))
    }

    fn finish_update(&mut self, optimizer: &mut Optimizer) -> Result<(), ShimError> {
        self.shim.finish_update(optimizer)
    }
}
