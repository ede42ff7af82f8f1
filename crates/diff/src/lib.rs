//! # Diff - A Small Reverse-Mode Autodiff Framework
//!
//! A self-contained tensor library with its own conventions, used as the
//! framework that graft shims wrap.
//!
//! ## Core Concepts
//!
//! - **Tensors are shared handles**: cloning shares storage, `copy_` writes in place
//! - **Dynamic tape**: operations on trainable tensors record how to differentiate
//! - **Seeded backward**: [`autograd::backward`] takes output gradients, not just a scalar loss
//! - **Modules own parameters**: state dicts name them, optimizers hold handles to them
//!
//! ## Modules
//!
//! - [`tensor`] - Tensor handles, devices, differentiable operations
//! - [`ops`] - Raw buffers and per-op forward/VJP rules
//! - [`autograd`] - Grad mode and the reverse pass
//! - [`nn`] - Layers, `Sequential`, the root `Model`
//! - [`optim`] - SGD, Adam, AdamW, gradient clipping
//! - [`serialize`] - Binary state dict format
//! - [`device`] - Host and accelerator slots
//!
//! ## Example
//!
//! ```rust
//! use graft_diff::nn::{Linear, Model};
//! use graft_diff::optim::Optimizer;
//! use graft_diff::{autograd, IValue, Tensor};
//!
//! let model = Model::new(Linear::new(2, 1, 0));
//! let mut opt = Optimizer::sgd(model.parameters(), 0.1, 0.0, 0.0);
//!
//! let x = Tensor::from_vec(vec![1, 2], vec![1.0, 2.0]).unwrap();
//! let y = model.forward(&[IValue::Tensor(x)], &Default::default()).unwrap();
//! let y = y.as_tensor().unwrap();
//! autograd::backward(&[y.clone()], &[Tensor::from_vec(vec![1, 1], vec![1.0]).unwrap()]).unwrap();
//! opt.step().unwrap();
//! ```

pub mod autograd;
pub mod device;
pub mod error;
pub mod nn;
pub mod ops;
pub mod optim;
pub mod serialize;
pub mod tensor;

pub use autograd::{backward, no_grad};
pub use device::Device;
pub use error::{DiffError, Result};
pub use nn::{IValue, Model, StateDict};
pub use tensor::Tensor;
