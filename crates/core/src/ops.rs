//! # Array Backends
//!
//! An [`Ops`] object answers two questions for code that moves data across a
//! framework boundary: *where do arrays live* (host or accelerator), and *how
//! are running averages maintained*.
//!
//! The active backend is chosen per thread. [`use_ops`] swaps it for the
//! lifetime of the returned guard:
//!
//! ```rust
//! use graft_core::ops::{current_ops, use_ops, DeviceType, GpuOps};
//!
//! assert_eq!(current_ops().device_type(), DeviceType::Cpu);
//! {
//!     let _guard = use_ops(GpuOps::new(0));
//!     assert_eq!(current_ops().device_type(), DeviceType::Gpu);
//! }
//! assert_eq!(current_ops().device_type(), DeviceType::Cpu);
//! ```

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use crate::array::Array;
use crate::error::CoreError;

/// Upper bound on the averaging decay.
pub const MAX_DECAY: f32 = 0.9999;

/// Where a backend keeps its arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Cpu,
    Gpu,
}

/// A compute device: the host, or an accelerator by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Gpu(usize),
}

impl Device {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(i) => write!(f, "cuda:{i}"),
        }
    }
}

impl FromStr for Device {
    type Err = CoreError;

    /// Accepts `"cpu"`, `"cuda:N"`, or a bare index `"N"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("cpu") {
            return Ok(Device::Cpu);
        }
        let index = s.strip_prefix("cuda:").unwrap_or(s);
        index
            .parse()
            .map(Device::Gpu)
            .map_err(|_| CoreError::InvalidDevice(s.to_string()))
    }
}

/// Array-backend interface.
pub trait Ops: fmt::Debug {
    fn name(&self) -> &'static str;

    fn device_type(&self) -> DeviceType;

    /// The device arrays of this backend live on.
    fn device(&self) -> Device;

    /// Move `ema` towards `weights` with a decay that warms up with `nr_update`.
    ///
    /// `decay = min((1 + t) / (10 + t), MAX_DECAY)`, then
    /// `ema -= (1 - decay) * (ema - weights)`.
    fn update_averages(
        &self,
        ema: &mut Array,
        weights: &Array,
        nr_update: usize,
    ) -> Result<(), CoreError> {
        if ema.shape != weights.shape {
            return Err(CoreError::ShapeMismatch {
                op: "update_averages",
                left: ema.shape.clone(),
                right: weights.shape.clone(),
            });
        }
        let t = nr_update as f32;
        let decay = ((1.0 + t) / (10.0 + t)).min(MAX_DECAY);
        for (e, w) in ema.data.iter_mut().zip(weights.data.iter()) {
            *e -= (1.0 - decay) * (*e - w);
        }
        Ok(())
    }
}

/// Host backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuOps;

impl Ops for CpuOps {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn device(&self) -> Device {
        Device::Cpu
    }
}

/// Accelerator backend bound to one device index.
#[derive(Debug, Clone, Copy)]
pub struct GpuOps {
    pub device_id: usize,
}

impl GpuOps {
    pub fn new(device_id: usize) -> Self {
        Self { device_id }
    }
}

impl Ops for GpuOps {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Gpu
    }

    fn device(&self) -> Device {
        Device::Gpu(self.device_id)
    }
}

thread_local! {
    static CURRENT_OPS: RefCell<Option<Rc<dyn Ops>>> = const { RefCell::new(None) };
}

/// The backend active on this thread. Defaults to [`CpuOps`].
pub fn current_ops() -> Rc<dyn Ops> {
    CURRENT_OPS.with(|slot| {
        slot.borrow()
            .clone()
            .unwrap_or_else(|| Rc::new(CpuOps) as Rc<dyn Ops>)
    })
}

/// Restores the previous backend when dropped.
#[must_use = "the backend is reset as soon as the guard is dropped"]
pub struct OpsGuard {
    prev: Option<Rc<dyn Ops>>,
}

/// Make `ops` the current backend until the guard is dropped.
pub fn use_ops(ops: impl Ops + 'static) -> OpsGuard {
    CURRENT_OPS.with(|slot| {
        let prev = slot.borrow_mut().replace(Rc::new(ops));
        OpsGuard { prev }
    })
}

impl Drop for OpsGuard {
    fn drop(&mut self) {
        CURRENT_OPS.with(|slot| {
            *slot.borrow_mut() = self.prev.take();
        });
    }
}
