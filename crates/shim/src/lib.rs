//! # Shim - Foreign Models as Graft Layers
//!
//! A shim wraps a model owned by another autodiff framework so the graft
//! orchestrator can train it like any native layer, without ever touching
//! the framework's tensors itself.
//!
//! ## What a shim does
//!
//! - **Calls**: `call(inputs, is_train)` returns outputs and a backprop callback
//! - **Updates**: `finish_update` drives a lazily built foreign optimizer
//! - **Averages**: keeps running parameter averages in the generic optimizer
//! - **Scoped parameters**: `use_params` evaluates with e.g. averaged weights
//! - **Placement and persistence**: `to_device`, `to_bytes`, `from_bytes`
//!
//! ## Modules
//!
//! - [`shim`] - The `Shim` itself
//! - [`framework`] - Traits a wrapped framework implements
//! - [`optim`] - Mapping generic optimizer settings to an update rule
//! - [`envelope`] - The serialized `{config, state}` layout
//! - [`reference`] - `graft-diff` as a framework
//! - [`torch`] - libtorch via `tch` (feature `tch`)
//! - [`wrapper`] - `ShimLayer`, an `Array`-in/`Array`-out layer
//!
//! ## Example
//!
//! ```rust
//! use graft_core::{ArgsKwargs, Optimizer};
//! use graft_diff::nn::{Linear, ReLU, Sequential};
//! use graft_diff::Tensor;
//! use graft_shim::reference::diff_shim;
//!
//! let net = Sequential::new().add(Linear::new(2, 8, 0)).add(ReLU).add(Linear::new(8, 1, 1));
//! let mut shim = diff_shim(net, serde_json::json!({"hidden": 8}));
//!
//! let x = Tensor::from_vec(vec![4, 2], vec![0.5; 8]).unwrap();
//! let (y, backprop) = shim.call(ArgsKwargs::from_tensors([x]), true).unwrap();
//! assert_eq!(y.as_tensor().unwrap().shape(), vec![4, 1]);
//!
//! let dy = Tensor::from_vec(vec![4, 1], vec![1.0; 4]).unwrap();
//! backprop(ArgsKwargs::from_tensors([dy])).unwrap();
//!
//! let mut optimizer = Optimizer::adam(0.001);
//! shim.finish_update(&mut optimizer).unwrap();
//! assert_eq!(optimizer.averages.as_ref().unwrap().len(), 4);
//! ```

pub mod envelope;
pub mod error;
pub mod framework;
pub mod optim;
pub mod reference;
pub mod shim;
pub mod torch;
pub mod wrapper;

pub use error::ShimError;
pub use framework::{ForeignModel, ForeignOptimizer, Framework, NamedTensors};
pub use optim::UpdateRule;
pub use reference::{diff_shim, Diff, DiffShim};
pub use shim::{Shim, ShimBackprop, DEFAULT_INIT_STEPS};
pub use torch::load_script_module;
pub use wrapper::ShimLayer;
