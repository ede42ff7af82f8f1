//! # The Shim
//!
//! [`Shim`] owns one foreign model and makes it callable the way native
//! layers are: inputs in, outputs plus a backprop callback out. It also
//! keeps the foreign optimizer, writes parameter averages into the generic
//! [`Optimizer`], swaps parameters in and out for [`Shim::use_params`], and
//! serializes the model together with its config.
//!
//! ## Training step
//!
//! ```text
//! call(inputs, true) ──► begin_update ──► (outputs, backprop)
//!                                               │
//!                     loss computed elsewhere   │
//!                                               ▼
//!                       backprop(d_outputs) ──► d_inputs
//!
//! finish_update(optimizer): build/refresh foreign optimizer ──► clip ──► step
//!                           ──► zero_grad ──► update_averages
//! ```
//!
//! Optimizer-side state for this shim is keyed by `ParamKey { owner: shim.id(),
//! name }`, so several shims can share one generic optimizer.

use std::collections::HashMap;

use tracing::{debug, warn};

use graft_core::{current_ops, ArgsKwargs, Array, Backprop, Device, DeviceType, Id, Optimizer, ParamKey, Value};

use crate::envelope;
use crate::error::ShimError;
use crate::framework::{ErrorOf, ForeignModel, ForeignOptimizer, Framework, NamedTensors, TensorOf};
use crate::optim::UpdateRule;

/// Backprop callback returned by [`Shim::call`]: output gradients in, input
/// gradients out.
pub type ShimBackprop<T> = Backprop<ArgsKwargs<T>, ArgsKwargs<T>, ShimError>;

/// Averaging starts counting from here unless told otherwise.
pub const DEFAULT_INIT_STEPS: usize = 1;

fn foreign<M: ForeignModel>(err: ErrorOf<M>) -> ShimError {
    ShimError::framework(<M::Framework as Framework>::NAME, err)
}

/// A foreign model wrapped as a graft layer.
pub struct Shim<M: ForeignModel> {
    id: Id,
    model: M,
    config: serde_json::Value,
    optimizer: Option<M::Optimizer>,
}

impl<M: ForeignModel> Shim<M> {
    /// Wrap `model`. `config` describes how to rebuild its architecture.
    pub fn new(model: M, config: serde_json::Value) -> Self {
        let id = Id::next();
        debug!(shim = %id, framework = M::Framework::NAME, "created shim");
        Self {
            id,
            model,
            config,
            optimizer: None,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn config(&self) -> &serde_json::Value {
        &self.config
    }

    /// The foreign optimizer, once the first `finish_update` has built it.
    pub fn foreign_optimizer(&self) -> Option<&M::Optimizer> {
        self.optimizer.as_ref()
    }

    /// Key under which parameter `name` of this shim is tracked.
    pub fn param_key(&self, name: impl Into<String>) -> ParamKey {
        ParamKey::new(self.id, name)
    }

    /// Route to [`Shim::begin_update`] when training, else [`Shim::predict`].
    #[allow(clippy::type_complexity)]
    pub fn call(
        &mut self,
        inputs: ArgsKwargs<TensorOf<M>>,
        is_train: bool,
    ) -> Result<(Value<TensorOf<M>>, ShimBackprop<TensorOf<M>>), ShimError> {
        if is_train {
            self.begin_update(inputs)
        } else {
            let outputs = self.predict(&inputs)?;
            let noop: ShimBackprop<TensorOf<M>> = Box::new(|_| Ok(ArgsKwargs::default()));
            Ok((outputs, noop))
        }
    }

    /// Forward pass in eval mode without gradient tracking.
    ///
    /// The model is back in training mode afterwards, whether or not the
    /// forward pass succeeded.
    pub fn predict(&mut self, inputs: &ArgsKwargs<TensorOf<M>>) -> Result<Value<TensorOf<M>>, ShimError> {
        self.model.set_training(false);
        let model = &mut self.model;
        let outputs = M::Framework::no_grad(|| model.forward(inputs));
        self.model.set_training(true);
        outputs.map_err(foreign::<M>)
    }

    /// Forward pass in training mode, returning a callback that backpropagates.
    ///
    /// The callback seeds the framework's reverse pass with the output
    /// gradients, which must mirror the outputs (a bare output counts as a
    /// single positional value; `Value::None` stands for "no gradient"). It
    /// returns `inputs` with every tensor replaced by its gradient, or by
    /// `Value::None` where none accumulated. Scalars are kept.
    #[allow(clippy::type_complexity)]
    pub fn begin_update(
        &mut self,
        inputs: ArgsKwargs<TensorOf<M>>,
    ) -> Result<(Value<TensorOf<M>>, ShimBackprop<TensorOf<M>>), ShimError> {
        self.model.set_training(true);
        let output = self.model.forward(&inputs).map_err(foreign::<M>)?;
        let tape = ArgsKwargs::from_output(output.map_tensors_ref(&mut |t| Value::Tensor(M::Framework::share(t))));

        let backprop: ShimBackprop<TensorOf<M>> = Box::new(move |grads: ArgsKwargs<TensorOf<M>>| {
            let pairs = tape.zip_tensors(&grads)?;
            let (outputs, seeds): (Vec<_>, Vec<_>) = pairs
                .into_iter()
                .map(|(o, g)| (M::Framework::share(o), M::Framework::share(g)))
                .unzip();
            M::Framework::backward(&outputs, &seeds).map_err(foreign::<M>)?;
            Ok(inputs.map_tensors(|t| match M::Framework::grad(&t) {
                Some(g) => Value::Tensor(g),
                None => Value::None,
            }))
        });
        Ok((output, backprop))
    }

    /// Apply the gradients accumulated by backprop, then update averages.
    ///
    /// The foreign optimizer is built on the first call and only has its
    /// hyperparameters refreshed afterwards, so momentum and moment estimates
    /// carry over.
    pub fn finish_update(&mut self, optimizer: &mut Optimizer) -> Result<(), ShimError> {
        let rule = UpdateRule::from_optimizer(optimizer)?;
        let foreign_opt = match self.optimizer {
            Some(ref mut existing) => {
                if existing.family() != rule.family() {
                    warn!(
                        shim = %self.id,
                        built = existing.family(),
                        requested = rule.family(),
                        "optimizer family changed; keeping the existing optimizer"
                    );
                }
                existing.update_groups(&rule).map_err(foreign::<M>)?;
                existing
            }
            None => {
                let built = self.model.build_optimizer(&rule).map_err(foreign::<M>)?;
                debug!(shim = %self.id, %rule, "built foreign optimizer");
                self.optimizer.insert(built)
            }
        };

        if let Some(max_norm) = optimizer.grad_clip.filter(|c| *c > 0.0) {
            let params = self.model.parameters().map_err(foreign::<M>)?;
            let norm = M::Framework::clip_grad_norm(&params, max_norm).map_err(foreign::<M>)?;
            debug!(shim = %self.id, norm, max_norm, "clipped gradients");
        }
        foreign_opt.step().map_err(foreign::<M>)?;
        foreign_opt.zero_grad().map_err(foreign::<M>)?;
        self.update_averages(optimizer)
    }

    /// Fold the current parameters into `optimizer.averages`.
    pub fn update_averages(&self, optimizer: &mut Optimizer) -> Result<(), ShimError> {
        self.update_averages_with(optimizer, DEFAULT_INIT_STEPS)
    }

    /// Like [`Shim::update_averages`]; a parameter seen for the first time
    /// starts with an exact copy and an update count of `init_steps`.
    pub fn update_averages_with(&self, optimizer: &mut Optimizer, init_steps: usize) -> Result<(), ShimError> {
        let Some(averages) = optimizer.averages.as_mut() else {
            return Ok(());
        };
        let ops = current_ops();
        for (name, tensor) in self.model.state_dict().map_err(foreign::<M>)? {
            let key = ParamKey::new(self.id, name);
            let count = optimizer.nr_update.entry(key.clone()).or_insert(0);
            *count += 1;
            let value = M::Framework::to_array(&tensor).map_err(foreign::<M>)?;
            match averages.get_mut(&key) {
                Some(average) => ops.update_averages(average, &value, *count)?,
                None => {
                    averages.insert(key, value);
                    *count = init_steps;
                }
            }
        }
        Ok(())
    }

    /// Run `work` with parameters taken from `params`, then put the originals back.
    ///
    /// Only keys owned by this shim are used. When there are none, `work`
    /// runs against the live parameters and nothing is copied. Otherwise the
    /// originals are restored on every exit path, including a panic in
    /// `work`.
    pub fn use_params<R>(
        &mut self,
        params: &HashMap<ParamKey, Array>,
        work: impl FnOnce(&mut Self) -> R,
    ) -> Result<R, ShimError> {
        with_params::<Self, M, R>(self, params, work)
    }

    /// Load this shim's entries of `params`, returning the replaced values.
    fn substitute(&mut self, params: &HashMap<ParamKey, Array>) -> Result<Option<NamedTensors<TensorOf<M>>>, ShimError> {
        let device = self.model.device();
        let substitute: NamedTensors<TensorOf<M>> = params
            .iter()
            .filter_map(|(key, value)| key.name_for(self.id).map(|name| (name, value)))
            .map(|(name, value)| {
                M::Framework::from_array(value, device, false)
                    .map(|t| (name.to_string(), t))
                    .map_err(foreign::<M>)
            })
            .collect::<Result<_, _>>()?;
        if substitute.is_empty() {
            return Ok(None);
        }

        let backup = self.model.state_dict().map_err(foreign::<M>)?;
        self.model
            .load_state_dict(&substitute, false)
            .map_err(foreign::<M>)?;
        debug!(shim = %self.id, params = substitute.len(), "substituted parameters");
        Ok(Some(backup))
    }

    /// Move the model's parameters and buffers to `device`.
    pub fn to_device(&mut self, device: Device) -> Result<(), ShimError> {
        self.model.to_device(device).map_err(foreign::<M>)?;
        debug!(shim = %self.id, %device, "moved shim");
        Ok(())
    }

    /// Serialize the parameters (in the framework's own format) and config.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ShimError> {
        let params = self.model.state_dict().map_err(foreign::<M>)?;
        let state = M::Framework::save_state(&params).map_err(foreign::<M>)?;
        let bytes = envelope::encode(&self.config, &state)?;
        debug!(shim = %self.id, state = state.len(), total = bytes.len(), "serialized shim");
        Ok(bytes)
    }

    /// Restore parameters and config from [`Shim::to_bytes`] output.
    ///
    /// Parameters land on the host when the current array backend is a host
    /// backend, otherwise on the framework's current accelerator. The model
    /// is moved there too. Nothing is modified unless the bytes decode and
    /// match the model.
    pub fn from_bytes(&mut self, bytes: &[u8]) -> Result<&mut Self, ShimError> {
        let envelope = envelope::decode(bytes)?;
        let map_location = match current_ops().device_type() {
            DeviceType::Cpu => Device::Cpu,
            DeviceType::Gpu => M::Framework::current_accelerator().map_err(foreign::<M>)?,
        };
        let state = M::Framework::load_state(&envelope.state, map_location).map_err(foreign::<M>)?;
        self.model.load_state_dict(&state, true).map_err(foreign::<M>)?;
        self.model.to_device(map_location).map_err(foreign::<M>)?;
        self.config = envelope.config;
        debug!(shim = %self.id, device = %map_location, params = state.len(), "restored shim");
        Ok(self)
    }
}

impl<M: ForeignModel> AsMut<Shim<M>> for Shim<M> {
    fn as_mut(&mut self) -> &mut Shim<M> {
        self
    }
}

/// [`Shim::use_params`] for anything that owns a shim.
pub(crate) fn with_params<H, M, R>(
    holder: &mut H,
    params: &HashMap<ParamKey, Array>,
    work: impl FnOnce(&mut H) -> R,
) -> Result<R, ShimError>
where
    H: AsMut<Shim<M>>,
    M: ForeignModel,
{
    let Some(backup) = holder.as_mut().substitute(params)? else {
        return Ok(work(holder));
    };
    let mut guard = RestoreGuard {
        holder,
        backup: Some(backup),
    };
    let result = work(guard.holder);
    guard.restore()?;
    Ok(result)
}

/// Puts a parameter backup back into the model when dropped.
struct RestoreGuard<'a, H: AsMut<Shim<M>>, M: ForeignModel> {
    holder: &'a mut H,
    backup: Option<NamedTensors<TensorOf<M>>>,
}

impl<H: AsMut<Shim<M>>, M: ForeignModel> RestoreGuard<'_, H, M> {
    fn restore(&mut self) -> Result<(), ShimError> {
        match self.backup.take() {
            Some(backup) => self
                .holder
                .as_mut()
                .model
                .load_state_dict(&backup, true)
                .map_err(foreign::<M>),
            None => Ok(()),
        }
    }
}

impl<H: AsMut<Shim<M>>, M: ForeignModel> Drop for RestoreGuard<'_, H, M> {
    fn drop(&mut self) {
        if let Err(err) = self.restore() {
            let id = self.holder.as_mut().id;
            warn!(shim = %id, error = %err, "failed to restore parameters");
        }
    }
}
