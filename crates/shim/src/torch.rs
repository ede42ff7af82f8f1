//! libtorch shims for TorchScript modules.
//!
//! Built only with the `tch` feature. Without it, [`load_script_module`]
//! still exists and fails with [`ShimError::FrameworkUnavailable`], so code
//! that merely links against this crate keeps compiling.

use std::path::Path;

use crate::error::ShimError;

#[cfg(feature = "tch")]
pub use imp::{Torch, TorchModule, TorchOptimizer};

/// Name used in errors and logs.
pub const LIBTORCH: &str = "libtorch";

/// A shim over a TorchScript module.
#[cfg(feature = "tch")]
pub type TorchShim = crate::shim::Shim<TorchModule>;

/// Cannot be constructed: this build has no libtorch support.
#[cfg(not(feature = "tch"))]
#[derive(Debug)]
pub enum TorchShim {}

/// Load a TorchScript file and wrap it.
#[cfg(feature = "tch")]
pub fn load_script_module(path: impl AsRef<Path>, config: serde_json::Value) -> Result<TorchShim, ShimError> {
    let module = tch::CModule::load(path).map_err(|e| ShimError::framework(LIBTORCH, e))?;
    Ok(crate::shim::Shim::new(TorchModule::new(module), config))
}

/// Load a TorchScript file and wrap it.
#[cfg(not(feature = "tch"))]
pub fn load_script_module(path: impl AsRef<Path>, _config: serde_json::Value) -> Result<TorchShim, ShimError> {
    tracing::warn!(path = %path.as_ref().display(), "libtorch support not compiled in");
    Err(ShimError::FrameworkUnavailable(LIBTORCH))
}

#[cfg(feature = "tch")]
mod imp {
    use std::collections::HashMap;
    use std::io::Cursor;

    use tch::{CModule, COptimizer, IValue, Kind, TchError, Tensor};
    use tracing::{debug, warn};

    use graft_core::{Array, ArgsKwargs, Device, Value};

    use super::LIBTORCH;
    use crate::framework::{ForeignModel, ForeignOptimizer, Framework, NamedTensors};
    use crate::optim::UpdateRule;

    /// Marker for libtorch via `tch`.
    pub struct Torch;

    fn to_tch(device: Device) -> tch::Device {
        match device {
            Device::Cpu => tch::Device::Cpu,
            Device::Gpu(i) => tch::Device::Cuda(i),
        }
    }

    fn from_tch(device: tch::Device) -> Device {
        match device {
            tch::Device::Cuda(i) => Device::Gpu(i),
            _ => Device::Cpu,
        }
    }

    fn to_ivalue(value: &Value<Tensor>) -> IValue {
        match value {
            Value::Tensor(t) => IValue::Tensor(t.shallow_clone()),
            Value::List(items) => IValue::Tuple(items.iter().map(to_ivalue).collect()),
            Value::Map(entries) => IValue::GenericDict(
                entries
                    .iter()
                    .map(|(k, v)| (IValue::String(k.clone()), to_ivalue(v)))
                    .collect(),
            ),
            Value::Int(i) => IValue::Int(*i),
            Value::Float(x) => IValue::Double(*x),
            Value::Bool(b) => IValue::Bool(*b),
            Value::None => IValue::None,
        }
    }

    fn from_ivalue(value: IValue) -> Result<Value<Tensor>, TchError> {
        Ok(match value {
            IValue::Tensor(t) => Value::Tensor(t),
            IValue::Tuple(items) | IValue::GenericList(items) => {
                Value::List(items.into_iter().map(from_ivalue).collect::<Result<_, _>>()?)
            }
            IValue::TensorList(items) => Value::List(items.into_iter().map(Value::Tensor).collect()),
            IValue::GenericDict(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| match k {
                        IValue::String(k) => from_ivalue(v).map(|v| (k, v)),
                        other => Err(TchError::Convert(format!("non-string output key {other:?}"))),
                    })
                    .collect::<Result<_, _>>()?,
            ),
            IValue::Int(i) => Value::Int(i),
            IValue::Double(x) => Value::Float(x),
            IValue::Bool(b) => Value::Bool(b),
            IValue::None => Value::None,
            other => return Err(TchError::Convert(format!("unsupported module output {other:?}"))),
        })
    }

    impl Framework for Torch {
        const NAME: &'static str = LIBTORCH;

        type Tensor = Tensor;
        type Error = TchError;

        fn share(tensor: &Tensor) -> Tensor {
            tensor.shallow_clone()
        }

        fn no_grad<R>(f: impl FnOnce() -> R) -> R {
            tch::no_grad(f)
        }

        fn backward(outputs: &[Tensor], grads: &[Tensor]) -> Result<(), TchError> {
            // Σ sum(output · grad) has exactly the seeded gradients.
            let mut total: Option<Tensor> = None;
            for (output, grad) in outputs.iter().zip(grads) {
                let term = output.f_mul(grad)?.f_sum(Kind::Float)?;
                total = Some(match total {
                    Some(acc) => acc.f_add(&term)?,
                    None => term,
                });
            }
            match total {
                Some(total) if !total.requires_grad() => {
                    Err(TchError::Torch("backward: no output requires grad".into()))
                }
                Some(total) => total.f_backward(),
                None => Ok(()),
            }
        }

        fn grad(tensor: &Tensor) -> Option<Tensor> {
            tensor.f_grad().ok().filter(Tensor::defined)
        }

        fn device(tensor: &Tensor) -> Device {
            from_tch(tensor.device())
        }

        fn to_array(tensor: &Tensor) -> Result<Array, TchError> {
            let shape: Vec<usize> = tensor.size().iter().map(|&d| d as usize).collect();
            let flat = tensor
                .f_to_device_(tch::Device::Cpu, Kind::Float, false, false)?
                .f_flatten(0, -1)?;
            let data = Vec::<f32>::try_from(&flat)?;
            Array::from_shape_vec(shape, data).map_err(|e| TchError::Convert(e.to_string()))
        }

        fn from_array(array: &Array, device: Device, requires_grad: bool) -> Result<Tensor, TchError> {
            let shape: Vec<i64> = array.shape.iter().map(|&d| d as i64).collect();
            Tensor::f_from_slice(&array.data)?
                .f_reshape(shape)?
                .f_to_device_(to_tch(device), Kind::Float, false, false)?
                .f_set_requires_grad(requires_grad)
        }

        fn clip_grad_norm(params: &[Tensor], max_norm: f32) -> Result<f32, TchError> {
            let mut grads: Vec<Tensor> = params
                .iter()
                .map(Tensor::f_grad)
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .filter(Tensor::defined)
                .collect();
            let mut sq = 0.0f64;
            for grad in &grads {
                let norm = grad.f_norm()?.f_double_value(&[])?;
                sq += norm * norm;
            }
            let total = sq.sqrt();
            if !total.is_finite() {
                return Err(TchError::Torch(format!("non-finite gradient norm {total}")));
            }
            let coef = max_norm as f64 / (total + 1e-6);
            if coef < 1.0 {
                tch::no_grad(|| -> Result<(), TchError> {
                    for grad in grads.iter_mut() {
                        grad.f_mul_scalar_(coef)?;
                    }
                    Ok(())
                })?;
            }
            Ok(total as f32)
        }

        fn save_state(state: &NamedTensors<Tensor>) -> Result<Vec<u8>, TchError> {
            let mut bytes = Vec::new();
            Tensor::save_multi_to_stream(state.as_slice(), &mut bytes)?;
            Ok(bytes)
        }

        fn load_state(bytes: &[u8], map_location: Device) -> Result<NamedTensors<Tensor>, TchError> {
            Tensor::load_multi_from_stream_with_device(Cursor::new(bytes), to_tch(map_location))
        }

        fn current_accelerator() -> Result<Device, TchError> {
            if tch::Cuda::is_available() {
                Ok(Device::Gpu(0))
            } else {
                Err(TchError::Torch("no CUDA device available".into()))
            }
        }
    }

    /// A TorchScript module with the mode and device the shim asked for.
    pub struct TorchModule {
        module: CModule,
        training: bool,
        device: tch::Device,
    }

    impl TorchModule {
        pub fn new(module: CModule) -> Self {
            let mut wrapped = Self {
                module,
                training: false,
                device: tch::Device::Cpu,
            };
            wrapped.set_training(true);
            wrapped
        }
    }

    impl ForeignModel for TorchModule {
        type Framework = Torch;
        type Optimizer = TorchOptimizer;

        fn forward(&mut self, inputs: &ArgsKwargs<Tensor>) -> Result<Value<Tensor>, TchError> {
            if !inputs.kwargs.is_empty() {
                return Err(TchError::Convert(
                    "TorchScript forward takes positional arguments only".into(),
                ));
            }
            let args: Vec<IValue> = inputs.args.iter().map(to_ivalue).collect();
            from_ivalue(self.module.forward_is(&args)?)
        }

        fn set_training(&mut self, training: bool) {
            let switched = if training {
                self.module.f_set_train()
            } else {
                self.module.f_set_eval()
            };
            match switched {
                Ok(()) => self.training = training,
                Err(err) => warn!(training, %err, "could not switch TorchScript mode"),
            }
        }

        fn is_training(&self) -> bool {
            self.training
        }

        fn device(&self) -> Device {
            from_tch(self.device)
        }

        fn parameters(&self) -> Result<Vec<Tensor>, TchError> {
            Ok(self.module.named_parameters()?.into_iter().map(|(_, t)| t).collect())
        }

        fn state_dict(&self) -> Result<NamedTensors<Tensor>, TchError> {
            self.module
                .named_parameters()?
                .into_iter()
                .map(|(name, t)| {
                    let detached = t.f_detach()?;
                    let mut copy = detached.f_zeros_like()?;
                    copy.f_copy_(&detached)?;
                    Ok((name, copy))
                })
                .collect()
        }

        fn load_state_dict(&mut self, state: &NamedTensors<Tensor>, strict: bool) -> Result<(), TchError> {
            let params: HashMap<String, Tensor> = self.module.named_parameters()?.into_iter().collect();
            for (name, value) in state {
                let param = params
                    .get(name)
                    .ok_or_else(|| TchError::TensorNameNotFound(name.clone(), "state dict".into()))?;
                if param.size() != value.size() {
                    return Err(TchError::Shape(format!(
                        "{name}: expected {:?}, got {:?}",
                        param.size(),
                        value.size()
                    )));
                }
            }
            if strict {
                if let Some(missing) = params.keys().find(|k| !state.iter().any(|(n, _)| n == *k)) {
                    return Err(TchError::TensorNameNotFound(missing.clone(), "state dict".into()));
                }
            }
            tch::no_grad(|| -> Result<(), TchError> {
                for (name, value) in state {
                    if let Some(param) = params.get(name) {
                        param.shallow_clone().f_copy_(value)?;
                    }
                }
                Ok(())
            })
        }

        fn to_device(&mut self, device: Device) -> Result<(), TchError> {
            let device = to_tch(device);
            if let tch::Device::Cuda(i) = device {
                let count = tch::Cuda::device_count() as usize;
                if i >= count {
                    return Err(TchError::Torch(format!("cuda:{i} requested, {count} devices visible")));
                }
            }
            self.module.f_to(device, Kind::Float, false)?;
            self.device = device;
            Ok(())
        }

        fn build_optimizer(&self, rule: &UpdateRule) -> Result<TorchOptimizer, TchError> {
            let mut inner = match *rule {
                UpdateRule::Adam {
                    lr,
                    betas,
                    eps,
                    weight_decay,
                } => COptimizer::adam(
                    lr as f64,
                    betas.0 as f64,
                    betas.1 as f64,
                    weight_decay as f64,
                    eps as f64,
                    false,
                )?,
                UpdateRule::AdamW {
                    lr,
                    betas,
                    eps,
                    weight_decay,
                } => COptimizer::adamw(
                    lr as f64,
                    betas.0 as f64,
                    betas.1 as f64,
                    weight_decay as f64,
                    eps as f64,
                    false,
                )?,
                UpdateRule::Sgd {
                    lr,
                    momentum,
                    weight_decay,
                } => COptimizer::sgd(lr as f64, momentum as f64, 0.0, weight_decay as f64, false)?,
            };
            for param in self.parameters()? {
                inner.add_parameters(&param, 0)?;
            }
            Ok(TorchOptimizer {
                inner,
                family: rule.family(),
            })
        }
    }

    pub struct TorchOptimizer {
        inner: COptimizer,
        family: &'static str,
    }

    impl ForeignOptimizer for TorchOptimizer {
        type Error = TchError;

        fn family(&self) -> &'static str {
            self.family
        }

        fn update_groups(&mut self, rule: &UpdateRule) -> Result<(), TchError> {
            self.inner.set_learning_rate(rule.lr() as f64)?;
            self.inner.set_weight_decay(rule.weight_decay() as f64)?;
            match *rule {
                UpdateRule::Sgd { momentum, .. } => self.inner.set_momentum(momentum as f64)?,
                // The C API can't change betas or eps after construction.
                UpdateRule::Adam { .. } | UpdateRule::AdamW { .. } => {
                    debug!("libtorch optimizer keeps its construction-time betas and eps")
                }
            }
            Ok(())
        }

        fn step(&mut self) -> Result<(), TchError> {
            self.inner.step()
        }

        fn zero_grad(&mut self) -> Result<(), TchError> {
            self.inner.zero_grad()
        }
    }
}
