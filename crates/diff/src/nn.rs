//! # Modules
//!
//! Layers implement [`Module`]: a single-tensor forward pass that knows
//! whether it is training, plus a way to enumerate named parameters. Networks
//! with several inputs or outputs implement [`Forward`] directly; every
//! `Module` is a `Forward` over one positional tensor.
//!
//! [`Model`] is the root object a caller owns. It holds the network, the
//! train/eval flag and the device, and provides state-dict access.
//!
//! ```rust
//! use graft_diff::nn::{Linear, Model, ReLU, Sequential};
//! use graft_diff::{IValue, Tensor};
//!
//! let net = Sequential::new()
//!     .add(Linear::new(3, 4, 0))
//!     .add(ReLU)
//!     .add(Linear::new(4, 1, 1));
//! let model = Model::new(net);
//! let x = Tensor::zeros(vec![2, 3]);
//! let y = model.forward(&[IValue::Tensor(x)], &Default::default()).unwrap();
//! assert_eq!(y.as_tensor().unwrap().shape(), vec![2, 1]);
//! ```

use std::cell::Cell;
use std::collections::BTreeMap;

use tracing::debug;

use crate::autograd::no_grad;
use crate::device::{check_available, Device};
use crate::error::{DiffError, Result};
use crate::tensor::Tensor;

/// Named tensors, ordered by name.
pub type StateDict = BTreeMap<String, Tensor>;

/// A value passed to or returned from a network.
#[derive(Debug, Clone)]
pub enum IValue {
    Tensor(Tensor),
    Tuple(Vec<IValue>),
    Dict(BTreeMap<String, IValue>),
    Int(i64),
    Double(f64),
    Bool(bool),
    None,
}

impl IValue {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            IValue::Tensor(t) => Some(t),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            IValue::Tensor(_) => "tensor",
            IValue::Tuple(_) => "tuple",
            IValue::Dict(_) => "dict",
            IValue::Int(_) => "int",
            IValue::Double(_) => "double",
            IValue::Bool(_) => "bool",
            IValue::None => "none",
        }
    }
}

/// A layer with a single tensor input and output.
pub trait Module {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor>;

    /// Report parameters as `prefix + local name`.
    fn visit_parameters(&self, _prefix: &str, _f: &mut dyn FnMut(String, &Tensor)) {}
}

/// A network called with positional and named values.
pub trait Forward {
    fn forward(
        &self,
        args: &[IValue],
        kwargs: &BTreeMap<String, IValue>,
        train: bool,
    ) -> Result<IValue>;

    fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(String, &Tensor));
}

impl<M: Module> Forward for M {
    fn forward(
        &self,
        args: &[IValue],
        kwargs: &BTreeMap<String, IValue>,
        train: bool,
    ) -> Result<IValue> {
        let xs = match (args, kwargs.get("input")) {
            ([IValue::Tensor(xs)], None) => xs,
            ([], Some(IValue::Tensor(xs))) if kwargs.len() == 1 => xs,
            ([other], None) => {
                return Err(DiffError::Format(format!(
                    "expected a tensor argument, got {}",
                    other.kind()
                )))
            }
            _ => {
                return Err(DiffError::Format(format!(
                    "expected one tensor argument, got {} positional and {} named",
                    args.len(),
                    kwargs.len()
                )))
            }
        };
        Module::forward_t(self, xs, train).map(IValue::Tensor)
    }

    fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(String, &Tensor)) {
        Module::visit_parameters(self, prefix, f)
    }
}

/// Fully connected layer: `y = x @ W + b`, `W` is `(in, out)`.
pub struct Linear {
    pub weight: Tensor,
    pub bias: Tensor,
}

impl Linear {
    /// Xavier-scaled normal init, reproducible for a given seed.
    pub fn new(in_dim: usize, out_dim: usize, seed: u64) -> Self {
        let scale = (2.0 / (in_dim + out_dim) as f32).sqrt();
        Self {
            weight: Tensor::randn(vec![in_dim, out_dim], scale, seed).requires_grad_(true),
            bias: Tensor::zeros(vec![out_dim]).requires_grad_(true),
        }
    }
}

impl Module for Linear {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Result<Tensor> {
        xs.matmul(&self.weight)?.add_bias(&self.bias)
    }

    fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(String, &Tensor)) {
        f(format!("{prefix}weight"), &self.weight);
        f(format!("{prefix}bias"), &self.bias);
    }
}

pub struct ReLU;

impl Module for ReLU {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Result<Tensor> {
        xs.relu()
    }
}

pub struct Tanh;

impl Module for Tanh {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Result<Tensor> {
        xs.tanh()
    }
}

/// Inverted dropout. Identity outside training.
pub struct Dropout {
    pub p: f32,
    state: Cell<u64>,
}

impl Dropout {
    pub fn new(p: f32, seed: u64) -> Self {
        Self {
            p,
            state: Cell::new(seed),
        }
    }

    fn next_uniform(&self) -> f32 {
        let s = self
            .state
            .get()
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state.set(s);
        (s >> 40) as f32 / (1u64 << 24) as f32
    }
}

impl Module for Dropout {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        if !train || self.p <= 0.0 {
            return Ok(xs.clone());
        }
        let keep = 1.0 - self.p;
        let mask: Vec<f32> = (0..xs.numel())
            .map(|_| {
                if self.next_uniform() < keep {
                    1.0 / keep
                } else {
                    0.0
                }
            })
            .collect();
        let mask = Tensor::from_vec(xs.shape(), mask)?.to_device(xs.device())?;
        xs.mul(&mask)
    }
}

/// Layers applied in order. Parameters are named `<index>.<name>`.
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, layer: impl Module + 'static) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut out = xs.clone();
        for layer in &self.layers {
            out = layer.forward_t(&out, train)?;
        }
        Ok(out)
    }

    fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(String, &Tensor)) {
        for (i, layer) in self.layers.iter().enumerate() {
            layer.visit_parameters(&format!("{prefix}{i}."), f);
        }
    }
}

/// Root object owning a network.
pub struct Model {
    net: Box<dyn Forward>,
    training: bool,
    device: Device,
}

impl Model {
    /// Wrap a network. New models start in training mode on the host.
    pub fn new(net: impl Forward + 'static) -> Self {
        Self {
            net: Box::new(net),
            training: true,
            device: Device::Cpu,
        }
    }

    pub fn forward(&self, args: &[IValue], kwargs: &BTreeMap<String, IValue>) -> Result<IValue> {
        self.net.forward(args, kwargs, self.training)
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let mut out = Vec::new();
        self.net
            .visit_parameters("", &mut |name, t| out.push((name, t.clone())));
        out
    }

    /// Parameter handles (sharing storage with the model).
    pub fn parameters(&self) -> Vec<Tensor> {
        self.named_parameters().into_iter().map(|(_, t)| t).collect()
    }

    /// Detached copies of every parameter.
    pub fn state_dict(&self) -> StateDict {
        self.named_parameters()
            .into_iter()
            .map(|(name, t)| (name, t.detach()))
            .collect()
    }

    /// Copy values from `state` into the parameters, in place.
    ///
    /// Every entry is validated before anything is written. With `strict`,
    /// `state` must name every parameter.
    pub fn load_state_dict(&mut self, state: &StateDict, strict: bool) -> Result<()> {
        let params: BTreeMap<String, Tensor> = self.named_parameters().into_iter().collect();
        for (name, value) in state {
            let param = params
                .get(name)
                .ok_or_else(|| DiffError::UnexpectedKey(name.clone()))?;
            if param.shape() != value.shape() {
                return Err(DiffError::ShapeMismatch {
                    op: "load_state_dict",
                    left: param.shape(),
                    right: value.shape(),
                });
            }
        }
        if strict {
            if let Some(missing) = params.keys().find(|name| !state.contains_key(*name)) {
                return Err(DiffError::MissingKey(missing.clone()));
            }
        }
        no_grad(|| -> Result<()> {
            for (name, value) in state {
                params[name].copy_(value)?;
            }
            Ok(())
        })
    }

    /// Move every parameter to `device`.
    pub fn to_device(&mut self, device: Device) -> Result<()> {
        check_available(device)?;
        for param in self.parameters() {
            param.move_to(device)?;
        }
        debug!(from = %self.device, to = %device, "moved model");
        self.device = device;
        Ok(())
    }
}
