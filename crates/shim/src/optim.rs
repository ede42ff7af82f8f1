//! # Optimizer Adapter
//!
//! Translates the generic [`Optimizer`]'s hyperparameters into the update
//! rule a foreign optimizer is built with:
//!
//! | b1 | b2 | L2_is_weight_decay | Rule |
//! |----|----|--------------------|------|
//! | ≠ 0 | ≠ 0 | true | AdamW (decoupled decay) |
//! | ≠ 0 | ≠ 0 | false | Adam (L2 in the gradient) |
//! | any | 0 | - | SGD, momentum `b1` |
//! | 0 | ≠ 0 | - | unsupported |

use std::fmt;

use graft_core::Optimizer;

use crate::error::ShimError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpdateRule {
    Adam {
        lr: f32,
        betas: (f32, f32),
        eps: f32,
        weight_decay: f32,
    },
    AdamW {
        lr: f32,
        betas: (f32, f32),
        eps: f32,
        weight_decay: f32,
    },
    Sgd {
        lr: f32,
        momentum: f32,
        weight_decay: f32,
    },
}

impl UpdateRule {
    pub fn from_optimizer(optimizer: &Optimizer) -> Result<Self, ShimError> {
        let (lr, weight_decay) = (optimizer.learn_rate, optimizer.l2);
        let (b1, b2) = (optimizer.b1, optimizer.b2);
        if b1 != 0.0 && b2 != 0.0 {
            let (betas, eps) = ((b1, b2), optimizer.eps);
            Ok(if optimizer.l2_is_weight_decay {
                UpdateRule::AdamW {
                    lr,
                    betas,
                    eps,
                    weight_decay,
                }
            } else {
                UpdateRule::Adam {
                    lr,
                    betas,
                    eps,
                    weight_decay,
                }
            })
        } else if b2 == 0.0 {
            Ok(UpdateRule::Sgd {
                lr,
                momentum: b1,
                weight_decay,
            })
        } else {
            Err(ShimError::UnsupportedOptimizer { b1, b2 })
        }
    }

    pub fn lr(&self) -> f32 {
        match *self {
            UpdateRule::Adam { lr, .. } | UpdateRule::AdamW { lr, .. } | UpdateRule::Sgd { lr, .. } => lr,
        }
    }

    pub fn weight_decay(&self) -> f32 {
        match *self {
            UpdateRule::Adam { weight_decay, .. }
            | UpdateRule::AdamW { weight_decay, .. }
            | UpdateRule::Sgd { weight_decay, .. } => weight_decay,
        }
    }

    /// `"adam"`, `"adamw"` or `"sgd"`.
    pub fn family(&self) -> &'static str {
        match self {
            UpdateRule::Adam { .. } => "adam",
            UpdateRule::AdamW { .. } => "adamw",
            UpdateRule::Sgd { .. } => "sgd",
        }
    }
}

impl fmt::Display for UpdateRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateRule::Adam { lr, betas, eps, weight_decay }
            | UpdateRule::AdamW { lr, betas, eps, weight_decay } => write!(
                f,
                "{}(lr={lr}, betas=({}, {}), eps={eps}, weight_decay={weight_decay})",
                self.family(),
                betas.0,
                betas.1
            ),
            UpdateRule::Sgd { lr, momentum, weight_decay } => {
                write!(f, "sgd(lr={lr}, momentum={momentum}, weight_decay={weight_decay})")
            }
        }
    }
}
