//! # Optimizers
//!
//! An [`Optimizer`] owns handles to the parameters it updates, grouped into
//! [`ParamGroup`]s that each carry their own hyperparameters. Per-parameter
//! state (moment estimates, momentum buffers) is keyed by tensor identity, so
//! it survives hyperparameter changes made through [`Optimizer::param_groups_mut`].
//!
//! - `Sgd`: `v = μ·v + g`, `θ -= lr·v` (plain SGD when `μ = 0`)
//! - `Adam`: L2 penalty folded into the gradient, bias-corrected moments
//! - `AdamW`: like Adam, with weight decay applied to the parameter directly
//!
//! ## Example
//!
//! ```rust
//! use graft_diff::optim::Optimizer;
//! use graft_diff::{autograd, Tensor};
//!
//! let w = Tensor::from_vec(vec![2], vec![1.0, 2.0]).unwrap().requires_grad_(true);
//! let mut opt = Optimizer::sgd(vec![w.clone()], 0.1, 0.0, 0.0);
//! let loss = w.sum().unwrap();
//! autograd::backward(&[loss], &[Tensor::scalar(1.0)]).unwrap();
//! opt.step().unwrap();
//! assert_eq!(w.to_vec(), vec![0.9, 1.9]);
//! ```

use std::collections::HashMap;

use tracing::trace;

use crate::autograd::no_grad;
use crate::error::{DiffError, Result};
use crate::ops::Buffer;
use crate::tensor::Tensor;

/// Which update rule an optimizer applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Sgd,
    Adam,
    AdamW,
}

/// Hyperparameters shared by a group of parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupOptions {
    pub lr: f32,
    pub weight_decay: f32,
    /// SGD only.
    pub momentum: f32,
    /// Adam/AdamW only.
    pub betas: (f32, f32),
    /// Adam/AdamW only.
    pub eps: f32,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            weight_decay: 0.0,
            momentum: 0.0,
            betas: (0.9, 0.999),
            eps: 1e-8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub params: Vec<Tensor>,
    pub options: GroupOptions,
}

#[derive(Default)]
struct ParamState {
    step: i32,
    exp_avg: Option<Buffer>,
    exp_avg_sq: Option<Buffer>,
    momentum_buffer: Option<Buffer>,
}

pub struct Optimizer {
    kind: OptimizerKind,
    groups: Vec<ParamGroup>,
    state: HashMap<usize, ParamState>,
    steps: usize,
}

impl Optimizer {
    pub fn new(kind: OptimizerKind, params: Vec<Tensor>, options: GroupOptions) -> Self {
        Self {
            kind,
            groups: vec![ParamGroup { params, options }],
            state: HashMap::new(),
            steps: 0,
        }
    }

    pub fn sgd(params: Vec<Tensor>, lr: f32, momentum: f32, weight_decay: f32) -> Self {
        let options = GroupOptions {
            lr,
            momentum,
            weight_decay,
            ..GroupOptions::default()
        };
        Self::new(OptimizerKind::Sgd, params, options)
    }

    pub fn adam(params: Vec<Tensor>, lr: f32, betas: (f32, f32), eps: f32, weight_decay: f32) -> Self {
        let options = GroupOptions {
            lr,
            betas,
            eps,
            weight_decay,
            ..GroupOptions::default()
        };
        Self::new(OptimizerKind::Adam, params, options)
    }

    pub fn adamw(params: Vec<Tensor>, lr: f32, betas: (f32, f32), eps: f32, weight_decay: f32) -> Self {
        let options = GroupOptions {
            lr,
            betas,
            eps,
            weight_decay,
            ..GroupOptions::default()
        };
        Self::new(OptimizerKind::AdamW, params, options)
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    pub fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    /// Number of completed `step` calls.
    pub fn step_count(&self) -> usize {
        self.steps
    }

    /// Apply one update to every parameter that has a gradient.
    ///
    /// Fails without touching any parameter if a gradient holds NaN or
    /// infinity.
    pub fn step(&mut self) -> Result<()> {
        for (g, group) in self.groups.iter().enumerate() {
            for (p, param) in group.params.iter().enumerate() {
                if let Some(grad) = param.grad_buffer() {
                    if !grad.is_finite() {
                        return Err(DiffError::NonFinite {
                            context: format!("gradient of group {g} param {p}"),
                        });
                    }
                }
            }
        }

        let kind = self.kind;
        let state = &mut self.state;
        no_grad(|| {
            for group in &self.groups {
                for param in &group.params {
                    let Some(grad) = param.grad_buffer() else {
                        continue;
                    };
                    let entry = state.entry(param.id()).or_default();
                    param.update(|value| match kind {
                        OptimizerKind::Sgd => sgd_update(value, grad, entry, &group.options),
                        OptimizerKind::Adam | OptimizerKind::AdamW => {
                            adam_update(value, grad, entry, &group.options, kind == OptimizerKind::AdamW)
                        }
                    });
                }
            }
        });
        self.steps += 1;
        trace!(kind = ?self.kind, steps = self.steps, "optimizer step");
        Ok(())
    }

    /// Clear the gradient of every managed parameter.
    pub fn zero_grad(&mut self) {
        for group in &self.groups {
            for param in &group.params {
                param.zero_grad();
            }
        }
    }
}

fn sgd_update(value: &mut Buffer, mut grad: Buffer, state: &mut ParamState, opts: &GroupOptions) {
    if opts.weight_decay != 0.0 {
        for (g, p) in grad.data.iter_mut().zip(&value.data) {
            *g += opts.weight_decay * p;
        }
    }
    let direction = if opts.momentum != 0.0 {
        let buf = match state.momentum_buffer.take() {
            Some(mut buf) => {
                for (v, g) in buf.data.iter_mut().zip(&grad.data) {
                    *v = opts.momentum * *v + g;
                }
                buf
            }
            None => grad,
        };
        state.momentum_buffer = Some(buf.clone());
        buf
    } else {
        grad
    };
    for (p, d) in value.data.iter_mut().zip(&direction.data) {
        *p -= opts.lr * d;
    }
    state.step += 1;
}

fn adam_update(
    value: &mut Buffer,
    mut grad: Buffer,
    state: &mut ParamState,
    opts: &GroupOptions,
    decoupled: bool,
) {
    if opts.weight_decay != 0.0 {
        if decoupled {
            let shrink = 1.0 - opts.lr * opts.weight_decay;
            for p in value.data.iter_mut() {
                *p *= shrink;
            }
        } else {
            for (g, p) in grad.data.iter_mut().zip(&value.data) {
                *g += opts.weight_decay * p;
            }
        }
    }

    state.step += 1;
    let (b1, b2) = opts.betas;
    let m = state.exp_avg.get_or_insert_with(|| value.zeros_like());
    let v = state.exp_avg_sq.get_or_insert_with(|| value.zeros_like());
    for ((m, v), g) in m.data.iter_mut().zip(v.data.iter_mut()).zip(&grad.data) {
        *m = b1 * *m + (1.0 - b1) * g;
        *v = b2 * *v + (1.0 - b2) * g * g;
    }

    let correction1 = 1.0 - b1.powi(state.step);
    let correction2 = 1.0 - b2.powi(state.step);
    for ((p, m), v) in value.data.iter_mut().zip(&m.data).zip(&v.data) {
        let m_hat = m / correction1;
        let v_hat = v / correction2;
        *p -= opts.lr * m_hat / (v_hat.sqrt() + opts.eps);
    }
}

/// Rescale gradients so their combined L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(params: &[Tensor], max_norm: f32) -> Result<f32> {
    let grads: Vec<(&Tensor, Buffer)> = params
        .iter()
        .filter_map(|p| p.grad_buffer().map(|g| (p, g)))
        .collect();
    let total = grads.iter().map(|(_, g)| g.sq_norm()).sum::<f32>().sqrt();
    if !total.is_finite() {
        return Err(DiffError::NonFinite {
            context: "total gradient norm".into(),
        });
    }
    let coef = max_norm / (total + 1e-6);
    if coef < 1.0 {
        for (param, grad) in grads {
            param.set_grad_buffer(Some(grad.map(|x| x * coef)));
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::backward;

    fn param(data: Vec<f32>) -> Tensor {
        Tensor::from_vec(vec![data.len()], data).unwrap().requires_grad_(true)
    }

    fn set_grad(t: &Tensor, grad: Vec<f32>) {
        t.set_grad_buffer(Some(Buffer::new(t.shape(), grad).unwrap()));
    }

    fn close(a: &[f32], b: &[f32]) -> bool {
        a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-5)
    }

    #[test]
    fn test_sgd_step() {
        let w = param(vec![1.0, 2.0, 3.0]);
        set_grad(&w, vec![0.1, 0.2, 0.3]);
        let mut opt = Optimizer::sgd(vec![w.clone()], 1.0, 0.0, 0.0);
        opt.step().unwrap();
        assert!(close(&w.to_vec(), &[0.9, 1.8, 2.7]));
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn test_sgd_momentum() {
        let w = param(vec![1.0, 2.0]);
        let mut opt = Optimizer::sgd(vec![w.clone()], 0.1, 0.9, 0.0);

        // First step: v = g
        set_grad(&w, vec![0.1, 0.1]);
        opt.step().unwrap();
        assert!(close(&w.to_vec(), &[0.99, 1.99]));

        // Second step: v = 0.9·g + g = 1.9·g
        opt.step().unwrap();
        assert!(close(&w.to_vec(), &[0.971, 1.971]));
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() {
        // With bias correction the first Adam step is lr·sign(g)
        let w = param(vec![1.0, -1.0]);
        set_grad(&w, vec![0.5, -2.0]);
        let mut opt = Optimizer::adam(vec![w.clone()], 0.01, (0.9, 0.999), 1e-8, 0.0);
        opt.step().unwrap();
        assert!(close(&w.to_vec(), &[0.99, -0.99]));
    }

    #[test]
    fn test_adamw_decay_is_decoupled() {
        // Zero gradient: Adam's folded L2 still produces an update through
        // the moments, AdamW only shrinks the weights.
        let w = param(vec![2.0]);
        set_grad(&w, vec![0.0]);
        let mut opt = Optimizer::adamw(vec![w.clone()], 0.1, (0.9, 0.999), 1e-8, 0.1);
        opt.step().unwrap();
        assert!(close(&w.to_vec(), &[1.98]));

        let a = param(vec![2.0]);
        set_grad(&a, vec![0.0]);
        let mut adam = Optimizer::adam(vec![a.clone()], 0.1, (0.9, 0.999), 1e-8, 0.1);
        adam.step().unwrap();
        assert!(close(&a.to_vec(), &[1.9]));
    }

    #[test]
    fn test_state_survives_option_changes() {
        let w = param(vec![1.0]);
        let mut opt = Optimizer::sgd(vec![w.clone()], 0.1, 0.9, 0.0);
        set_grad(&w, vec![1.0]);
        opt.step().unwrap();
        opt.param_groups_mut()[0].options.lr = 1.0;
        opt.step().unwrap();
        // v = 0.9 + 1 = 1.9, lr now 1.0
        assert!(close(&w.to_vec(), &[1.0 - 0.1 - 1.9]));
        assert_eq!(opt.param_groups()[0].options.lr, 1.0);
    }

    #[test]
    fn test_params_without_grad_are_skipped() {
        let a = param(vec![1.0]);
        let b = param(vec![1.0]);
        set_grad(&a, vec![1.0]);
        let mut opt = Optimizer::sgd(vec![a.clone(), b.clone()], 0.5, 0.0, 0.0);
        opt.step().unwrap();
        assert_eq!(a.to_vec(), vec![0.5]);
        assert_eq!(b.to_vec(), vec![1.0]);
    }

    #[test]
    fn test_non_finite_gradient_rejected() {
        let a = param(vec![1.0]);
        let b = param(vec![1.0]);
        set_grad(&a, vec![0.5]);
        set_grad(&b, vec![f32::NAN]);
        let mut opt = Optimizer::sgd(vec![a.clone(), b], 1.0, 0.0, 0.0);
        assert!(matches!(opt.step(), Err(DiffError::NonFinite { .. })));
        assert_eq!(a.to_vec(), vec![1.0]);
        assert_eq!(opt.step_count(), 0);
    }

    #[test]
    fn test_zero_grad() {
        let w = param(vec![1.0, 2.0]);
        let loss = w.sum().unwrap();
        backward(&[loss], &[Tensor::scalar(1.0)]).unwrap();
        let mut opt = Optimizer::sgd(vec![w.clone()], 0.1, 0.0, 0.0);
        opt.zero_grad();
        assert!(w.grad().is_none());
    }

    #[test]
    fn test_clip_grad_norm() {
        let a = param(vec![0.0, 0.0]);
        let b = param(vec![0.0]);
        set_grad(&a, vec![3.0, 0.0]);
        set_grad(&b, vec![4.0]);
        let norm = clip_grad_norm(&[a.clone(), b.clone()], 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-5);
        assert!(close(&a.grad().unwrap().to_vec(), &[0.6, 0.0]));
        assert!(close(&b.grad().unwrap().to_vec(), &[0.8]));

        // Under the limit: untouched
        let norm = clip_grad_norm(&[a.clone()], 10.0).unwrap();
        assert!(norm < 1.0);
        assert!(close(&a.grad().unwrap().to_vec(), &[0.6, 0.0]));

        set_grad(&b, vec![f32::INFINITY]);
        assert!(clip_grad_norm(&[b], 1.0).is_err());
    }
}
