//! # Core - Orchestrator-Side Primitives
//!
//! This crate provides what every graft layer shares:
//!
//! - **Arrays**: the native dense array type (`array`)
//! - **Payloads**: positional/named call values and gradients (`args`)
//! - **Keys**: typed `(owner, name)` parameter keys (`key`)
//! - **Backends**: host/accelerator selection and running averages (`ops`)
//! - **Optimizer**: hyperparameters, averaging state, native updates (`optimizer`)
//! - **Layers**: the forward/backprop calling convention (`model`)
//!
//! ## Design Philosophy
//!
//! Layers never share tensors, only payloads. A layer backed by another
//! framework converts at its own boundary, so the orchestrator can drive
//! native and foreign layers through the same training loop.

pub mod args;
pub mod array;
pub mod error;
pub mod key;
pub mod model;
pub mod ops;
pub mod optimizer;

pub use args::{ArgsKwargs, Value};
pub use array::Array;
pub use error::CoreError;
pub use key::{Id, ParamKey};
pub use model::{Backprop, Layer};
pub use ops::{current_ops, use_ops, CpuOps, Device, DeviceType, GpuOps, Ops};
pub use optimizer::{Optimizer, OptimizerConfig};
