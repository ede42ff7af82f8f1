//! `graft-diff` as a shim framework.
//!
//! Device mapping: `Device::Cpu` is the host, `Device::Gpu(i)` is
//! accelerator slot `i`.

use std::collections::BTreeMap;

use graft_core::{Array, ArgsKwargs, Device, Value};
use graft_diff::nn::{Forward, IValue, Model, StateDict};
use graft_diff::optim::{self, OptimizerKind};
use graft_diff::{autograd, device as diff_device, serialize, DiffError, Tensor};

use crate::framework::{ForeignModel, ForeignOptimizer, Framework, NamedTensors};
use crate::optim::UpdateRule;
use crate::shim::Shim;

/// Marker for the `graft-diff` framework.
#[derive(Debug, Clone, Copy, Default)]
pub struct Diff;

pub type DiffShim = Shim<Model>;

/// Wrap a `graft-diff` network.
pub fn diff_shim(net: impl Forward + 'static, config: serde_json::Value) -> DiffShim {
    Shim::new(Model::new(net), config)
}

fn to_diff(device: Device) -> diff_device::Device {
    match device {
        Device::Cpu => diff_device::Device::Cpu,
        Device::Gpu(i) => diff_device::Device::Accelerator(i),
    }
}

fn from_diff(device: diff_device::Device) -> Device {
    match device {
        diff_device::Device::Cpu => Device::Cpu,
        diff_device::Device::Accelerator(i) => Device::Gpu(i),
    }
}

fn to_ivalue(value: &Value<Tensor>) -> IValue {
    match value {
        Value::Tensor(t) => IValue::Tensor(t.clone()),
        Value::List(items) => IValue::Tuple(items.iter().map(to_ivalue).collect()),
        Value::Map(entries) => IValue::Dict(entries.iter().map(|(k, v)| (k.clone(), to_ivalue(v))).collect()),
        Value::Int(i) => IValue::Int(*i),
        Value::Float(x) => IValue::Double(*x),
        Value::Bool(b) => IValue::Bool(*b),
        Value::None => IValue::None,
    }
}

fn from_ivalue(value: IValue) -> Value<Tensor> {
    match value {
        IValue::Tensor(t) => Value::Tensor(t),
        IValue::Tuple(items) => Value::List(items.into_iter().map(from_ivalue).collect()),
        IValue::Dict(entries) => Value::Map(entries.into_iter().map(|(k, v)| (k, from_ivalue(v))).collect()),
        IValue::Int(i) => Value::Int(i),
        IValue::Double(x) => Value::Float(x),
        IValue::Bool(b) => Value::Bool(b),
        IValue::None => Value::None,
    }
}

impl Framework for Diff {
    const NAME: &'static str = "graft-diff";

    type Tensor = Tensor;
    type Error = DiffError;

    fn share(tensor: &Tensor) -> Tensor {
        tensor.clone()
    }

    fn no_grad<R>(f: impl FnOnce() -> R) -> R {
        autograd::no_grad(f)
    }

    fn backward(outputs: &[Tensor], grads: &[Tensor]) -> Result<(), DiffError> {
        autograd::backward(outputs, grads)
    }

    fn grad(tensor: &Tensor) -> Option<Tensor> {
        tensor.grad()
    }

    fn device(tensor: &Tensor) -> Device {
        from_diff(tensor.device())
    }

    fn to_array(tensor: &Tensor) -> Result<Array, DiffError> {
        let shape = tensor.shape();
        Array::from_shape_vec(shape.clone(), tensor.to_vec()).map_err(|_| DiffError::ShapeMismatch {
            op: "to_array",
            left: shape,
            right: vec![tensor.numel()],
        })
    }

    fn from_array(array: &Array, device: Device, requires_grad: bool) -> Result<Tensor, DiffError> {
        let tensor = Tensor::from_vec(array.shape.clone(), array.data.clone())?.requires_grad_(requires_grad);
        tensor.move_to(to_diff(device))?;
        Ok(tensor)
    }

    fn clip_grad_norm(params: &[Tensor], max_norm: f32) -> Result<f32, DiffError> {
        optim::clip_grad_norm(params, max_norm)
    }

    fn save_state(state: &NamedTensors<Tensor>) -> Result<Vec<u8>, DiffError> {
        let dict: StateDict = state.iter().map(|(k, t)| (k.clone(), t.clone())).collect();
        serialize::save(&dict)
    }

    fn load_state(bytes: &[u8], map_location: Device) -> Result<NamedTensors<Tensor>, DiffError> {
        Ok(serialize::load(bytes, to_diff(map_location))?.into_iter().collect())
    }

    fn current_accelerator() -> Result<Device, DiffError> {
        diff_device::current_accelerator().map(from_diff)
    }
}

impl ForeignModel for Model {
    type Framework = Diff;
    type Optimizer = optim::Optimizer;

    fn forward(&mut self, inputs: &ArgsKwargs<Tensor>) -> Result<Value<Tensor>, DiffError> {
        let args: Vec<IValue> = inputs.args.iter().map(to_ivalue).collect();
        let kwargs: BTreeMap<String, IValue> = inputs
            .kwargs
            .iter()
            .map(|(k, v)| (k.clone(), to_ivalue(v)))
            .collect();
        Model::forward(self, &args, &kwargs).map(from_ivalue)
    }

    fn set_training(&mut self, training: bool) {
        if training {
            self.train()
        } else {
            self.eval()
        }
    }

    fn is_training(&self) -> bool {
        Model::is_training(self)
    }

    fn device(&self) -> Device {
        from_diff(Model::device(self))
    }

    fn parameters(&self) -> Result<Vec<Tensor>, DiffError> {
        Ok(Model::parameters(self))
    }

    fn state_dict(&self) -> Result<NamedTensors<Tensor>, DiffError> {
        Ok(Model::state_dict(self).into_iter().collect())
    }

    fn load_state_dict(&mut self, state: &NamedTensors<Tensor>, strict: bool) -> Result<(), DiffError> {
        let dict: StateDict = state.iter().map(|(k, t)| (k.clone(), t.clone())).collect();
        Model::load_state_dict(self, &dict, strict)
    }

    fn to_device(&mut self, device: Device) -> Result<(), DiffError> {
        Model::to_device(self, to_diff(device))
    }

    fn build_optimizer(&self, rule: &UpdateRule) -> Result<optim::Optimizer, DiffError> {
        let params = Model::parameters(self);
        Ok(match *rule {
            UpdateRule::Adam {
                lr,
                betas,
                eps,
                weight_decay,
            } => optim::Optimizer::adam(params, lr, betas, eps, weight_decay),
            UpdateRule::AdamW {
                lr,
                betas,
                eps,
                weight_decay,
            } => optim::Optimizer::adamw(params, lr, betas, eps, weight_decay),
            UpdateRule::Sgd {
                lr,
                momentum,
                weight_decay,
            } => optim::Optimizer::sgd(params, lr, momentum, weight_decay),
        })
    }
}

impl ForeignOptimizer for optim::Optimizer {
    type Error = DiffError;

    fn family(&self) -> &'static str {
        match self.kind() {
            OptimizerKind::Sgd => "sgd",
            OptimizerKind::Adam => "adam",
            OptimizerKind::AdamW => "adamw",
        }
    }

    fn update_groups(&mut self, rule: &UpdateRule) -> Result<(), DiffError> {
        for group in self.param_groups_mut() {
            let options = &mut group.options;
            options.lr = rule.lr();
            options.weight_decay = rule.weight_decay();
            match *rule {
                UpdateRule::Adam { betas, eps, .. } | UpdateRule::AdamW { betas, eps, .. } => {
                    options.betas = betas;
                    options.eps = eps;
                }
                UpdateRule::Sgd { momentum, .. } => options.momentum = momentum,
            }
        }
        Ok(())
    }

    fn step(&mut self) -> Result<(), DiffError> {
        optim::Optimizer::step(self)
    }

    fn zero_grad(&mut self) -> Result<(), DiffError> {
        optim::Optimizer::zero_grad(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graft_diff::nn::Linear;

    #[test]
    fn test_array_conversion() {
        let array = Array::matrix(2, 2, vec![1.0, 2.0, 3.0, 4.0]);
        let tensor = Diff::from_array(&array, Device::Cpu, true).unwrap();
        assert!(tensor.requires_grad());
        assert_eq!(Diff::to_array(&tensor).unwrap(), array);
    }

    #[test]
    fn test_ivalue_conversion_keeps_structure() {
        let t = Tensor::zeros(vec![1]);
        let value = Value::List(vec![
            Value::Tensor(t.clone()),
            Value::Map([("k".to_string(), Value::Float(0.5))].into_iter().collect()),
            Value::None,
        ]);
        match from_ivalue(to_ivalue(&value)) {
            Value::List(items) => {
                assert_eq!(items.len(), 3);
                assert_eq!(items[0].as_tensor().map(Tensor::id), Some(t.id()));
                assert!(matches!(&items[1], Value::Map(m) if matches!(m["k"], Value::Float(x) if x == 0.5)));
            }
            other => panic!("expected list, got {}", other.kind()),
        }
    }

    #[test]
    fn test_update_groups_keeps_kind() {
        let model = Model::new(Linear::new(2, 2, 0));
        let rule = UpdateRule::Sgd {
            lr: 0.1,
            momentum: 0.9,
            weight_decay: 0.0,
        };
        let mut opt = model.build_optimizer(&rule).unwrap();
        assert_eq!(opt.family(), "sgd");
        opt.update_groups(&UpdateRule::Adam {
            lr: 0.5,
            betas: (0.8, 0.9),
            eps: 1e-6,
            weight_decay: 0.1,
        })
        .unwrap();
        assert_eq!(opt.family(), "sgd");
        let options = &opt.param_groups()[0].options;
        assert_eq!(options.lr, 0.5);
        assert_eq!(options.betas, (0.8, 0.9));
        assert_eq!(options.weight_decay, 0.1);
    }
}
