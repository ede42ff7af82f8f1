//! # Optimizer
//!
//! The generic optimizer shared by every layer of a model. It carries:
//!
//! - Hyperparameters (`learn_rate`, `l2`, `b1`, `b2`, `eps`, `grad_clip`)
//! - `averages`: running averages of parameters, keyed by [`ParamKey`]
//! - `nr_update`: per-key update counters driving the averaging decay
//!
//! Native layers call [`Optimizer::step`] with their own parameters. Layers that
//! wrap a foreign framework read the hyperparameters to configure the
//! framework's optimizer and write into `averages`/`nr_update` themselves.
//!
//! ## Update rules
//!
//! | b1 | b2 | Rule |
//! |----|----|------|
//! | ≠ 0 | ≠ 0 | Adam: `m = b1·m + (1-b1)·g`, `v = b2·v + (1-b2)·g²`, bias corrected |
//! | any | 0 | SGD with momentum `b1`: `v = b1·v + g`, `θ -= lr·v` |
//!
//! ## Example
//!
//! ```rust
//! use graft_core::{Array, Id, Optimizer, ParamKey};
//!
//! let mut optimizer = Optimizer::sgd(0.1);
//! let key = ParamKey::new(Id::next(), "W");
//! let mut param = Array::vector(vec![1.0, 2.0]);
//! let grad = Array::vector(vec![1.0, 1.0]);
//! optimizer.step(&key, &mut param, &grad).unwrap();
//! assert!((param.data[0] - 0.9).abs() < 1e-6);
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::array::Array;
use crate::error::CoreError;
use crate::key::ParamKey;
use crate::ops::current_ops;

/// Serializable optimizer settings.
///
/// Missing fields take the defaults of [`OptimizerConfig::default`] (Adam).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub learn_rate: f32,
    #[serde(rename = "L2")]
    pub l2: f32,
    #[serde(rename = "L2_is_weight_decay")]
    pub l2_is_weight_decay: bool,
    pub b1: f32,
    pub b2: f32,
    pub eps: f32,
    pub grad_clip: Option<f32>,
    pub use_averages: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learn_rate: 0.001,
            l2: 0.0,
            l2_is_weight_decay: true,
            b1: 0.9,
            b2: 0.999,
            eps: 1e-8,
            grad_clip: Some(1.0),
            use_averages: true,
        }
    }
}

impl OptimizerConfig {
    /// Parse a JSON object, e.g. `{"learn_rate": 0.01, "b2": 0.0}`.
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        serde_json::from_str(json).map_err(|e| CoreError::InvalidConfig {
            reason: e.to_string(),
        })
    }
}

/// Per-parameter moment buffers.
#[derive(Debug, Clone)]
struct Moments {
    m: Array,
    v: Array,
    t: i32,
}

/// Generic gradient-descent optimizer with parameter averaging.
#[derive(Debug, Clone)]
pub struct Optimizer {
    pub learn_rate: f32,
    pub l2: f32,
    pub l2_is_weight_decay: bool,
    pub b1: f32,
    pub b2: f32,
    pub eps: f32,
    pub grad_clip: Option<f32>,
    /// Running parameter averages; `None` disables averaging.
    pub averages: Option<HashMap<ParamKey, Array>>,
    pub nr_update: HashMap<ParamKey, usize>,
    moments: HashMap<ParamKey, Moments>,
}

impl Optimizer {
    pub fn from_config(config: OptimizerConfig) -> Self {
        Self {
            learn_rate: config.learn_rate,
            l2: config.l2,
            l2_is_weight_decay: config.l2_is_weight_decay,
            b1: config.b1,
            b2: config.b2,
            eps: config.eps,
            grad_clip: config.grad_clip,
            averages: config.use_averages.then(HashMap::new),
            nr_update: HashMap::new(),
            moments: HashMap::new(),
        }
    }

    /// Adam with the default moment coefficients.
    pub fn adam(learn_rate: f32) -> Self {
        Self::from_config(OptimizerConfig {
            learn_rate,
            ..OptimizerConfig::default()
        })
    }

    /// Plain SGD: no momentum, no weight decay, no clipping.
    pub fn sgd(learn_rate: f32) -> Self {
        Self::from_config(OptimizerConfig {
            learn_rate,
            l2: 0.0,
            l2_is_weight_decay: false,
            b1: 0.0,
            b2: 0.0,
            grad_clip: None,
            ..OptimizerConfig::default()
        })
    }

    pub fn config(&self) -> OptimizerConfig {
        OptimizerConfig {
            learn_rate: self.learn_rate,
            l2: self.l2,
            l2_is_weight_decay: self.l2_is_weight_decay,
            b1: self.b1,
            b2: self.b2,
            eps: self.eps,
            grad_clip: self.grad_clip,
            use_averages: self.averages.is_some(),
        }
    }

    /// Whether `b1`/`b2` select the Adam rule.
    pub fn uses_adam(&self) -> bool {
        self.b1 != 0.0 && self.b2 != 0.0
    }

    /// Update `param` in place from `grad`.
    ///
    /// Clips `grad` to `grad_clip` (by norm), applies L2 either as decoupled
    /// weight decay or folded into the gradient, takes the Adam or momentum
    /// step, then updates the running average for `key`.
    pub fn step(&mut self, key: &ParamKey, param: &mut Array, grad: &Array) -> Result<(), CoreError> {
        if param.shape != grad.shape {
            return Err(CoreError::ShapeMismatch {
                op: "optimizer step",
                left: param.shape.clone(),
                right: grad.shape.clone(),
            });
        }

        let moment = self.moments.get(key).map(|m| &m.m);
        let average = self.averages.as_ref().and_then(|a| a.get(key));
        if let Some(seen) = moment.or(average).filter(|s| s.shape != param.shape) {
            return Err(CoreError::ShapeMismatch {
                op: "optimizer step",
                left: seen.shape.clone(),
                right: param.shape.clone(),
            });
        }

        let mut grad = grad.clone();
        if let Some(max_norm) = self.grad_clip.filter(|c| *c > 0.0) {
            let norm = grad.norm();
            if norm > max_norm {
                trace!(%key, norm, max_norm, "clipped gradient");
                grad = grad.scale(max_norm / norm);
            }
        }

        if self.l2 != 0.0 {
            if self.l2_is_weight_decay {
                let decay = 1.0 - self.learn_rate * self.l2;
                param.data.iter_mut().for_each(|p| *p *= decay);
            } else {
                grad.axpy(self.l2, param)?;
            }
        }

        if self.uses_adam() {
            self.adam_step(key, param, &grad);
        } else {
            self.momentum_step(key, param, &grad);
        }

        self.update_average(key, param)
    }

    fn adam_step(&mut self, key: &ParamKey, param: &mut Array, grad: &Array) {
        let (b1, b2, eps, lr) = (self.b1, self.b2, self.eps, self.learn_rate);
        let moments = self.moments.entry(key.clone()).or_insert_with(|| Moments {
            m: grad.zeros_like(),
            v: grad.zeros_like(),
            t: 0,
        });
        moments.t += 1;
        let bias1 = 1.0 - b1.powi(moments.t);
        let bias2 = 1.0 - b2.powi(moments.t);
        for i in 0..param.data.len() {
            let g = grad.data[i];
            moments.m.data[i] = b1 * moments.m.data[i] + (1.0 - b1) * g;
            moments.v.data[i] = b2 * moments.v.data[i] + (1.0 - b2) * g * g;
            let m_hat = moments.m.data[i] / bias1;
            let v_hat = moments.v.data[i] / bias2;
            param.data[i] -= lr * m_hat / (v_hat.sqrt() + eps);
        }
    }

    fn momentum_step(&mut self, key: &ParamKey, param: &mut Array, grad: &Array) {
        let (momentum, lr) = (self.b1, self.learn_rate);
        let velocity = &mut self
            .moments
            .entry(key.clone())
            .or_insert_with(|| Moments {
                m: grad.zeros_like(),
                v: Array::zeros(vec![]),
                t: 0,
            })
            .m;
        // v = momentum * v + grad; θ = θ - lr * v
        for ((p, v), g) in param
            .data
            .iter_mut()
            .zip(velocity.data.iter_mut())
            .zip(grad.data.iter())
        {
            *v = momentum * *v + g;
            *p -= lr * *v;
        }
    }

    /// Record one more update of `key` and fold `param` into its average.
    ///
    /// The first update initializes the average as a copy of `param`.
    pub fn update_average(&mut self, key: &ParamKey, param: &Array) -> Result<(), CoreError> {
        let Some(averages) = self.averages.as_mut() else {
            return Ok(());
        };
        let count = self.nr_update.entry(key.clone()).or_insert(0);
        *count += 1;
        match averages.get_mut(key) {
            Some(average) => current_ops().update_averages(average, param, *count),
            None => {
                averages.insert(key.clone(), param.clone());
                Ok(())
            }
        }
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::from_config(OptimizerConfig::default())
    }
}
