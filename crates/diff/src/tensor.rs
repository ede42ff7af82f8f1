//! # Tensors
//!
//! A [`Tensor`] is a shared handle: cloning it clones the handle, not the
//! storage, so a module and an optimizer can hold the same parameter. Each
//! tensor records:
//!
//! - its storage and device
//! - whether gradients should flow to it (`requires_grad`)
//! - the accumulated gradient, for leaves
//! - the tape entry (`grad_fn`) that produced it, for results of operations
//!
//! ## Example
//!
//! ```rust
//! use graft_diff::{autograd, Tensor};
//!
//! let w = Tensor::from_vec(vec![2], vec![1.0, -2.0]).unwrap().requires_grad_(true);
//! let y = w.relu().unwrap().sum().unwrap();
//! autograd::backward(&[y], &[Tensor::scalar(1.0)]).unwrap();
//! assert_eq!(w.grad().unwrap().to_vec(), vec![1.0, 0.0]);
//! ```

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::autograd::is_grad_enabled;
use crate::device::{check_available, Device};
use crate::error::{DiffError, Result};
use crate::ops::{Buffer, DiffOp};

static NEXT_TENSOR_ID: AtomicUsize = AtomicUsize::new(1);

/// Tape entry: the op that produced a tensor and what it needs for backward.
pub(crate) struct GradFn {
    pub op: DiffOp,
    pub inputs: Vec<Tensor>,
    pub saved: Vec<Buffer>,
}

pub(crate) struct TensorInner {
    pub id: usize,
    pub buf: Buffer,
    pub device: Device,
    pub requires_grad: bool,
    pub grad: Option<Buffer>,
    pub grad_fn: Option<Rc<GradFn>>,
}

/// Shared handle to a tensor.
#[derive(Clone)]
pub struct Tensor(pub(crate) Rc<RefCell<TensorInner>>);

impl Tensor {
    fn from_buffer(buf: Buffer, device: Device) -> Self {
        Tensor(Rc::new(RefCell::new(TensorInner {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            buf,
            device,
            requires_grad: false,
            grad: None,
            grad_fn: None,
        })))
    }

    /// New host tensor from row-major data.
    pub fn from_vec(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        Ok(Self::from_buffer(Buffer::new(shape, data)?, Device::Cpu))
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::from_buffer(Buffer::full(shape, 0.0), Device::Cpu)
    }

    pub fn scalar(value: f32) -> Self {
        Self::from_buffer(Buffer::full(vec![], value), Device::Cpu)
    }

    /// Seeded normal initialization.
    pub fn randn(shape: Vec<usize>, scale: f32, seed: u64) -> Self {
        let size: usize = shape.iter().product();
        let mut data = Vec::with_capacity(size);
        let mut state = seed;
        for _ in 0..size {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let u1 = ((state >> 11) as f32 / (1u64 << 53) as f32).max(1e-10);
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let u2 = (state >> 11) as f32 / (1u64 << 53) as f32;
            let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos();
            data.push(z * scale);
        }
        Self::from_buffer(Buffer { shape, data }, Device::Cpu)
    }

    /// Stable identity of the underlying storage.
    pub fn id(&self) -> usize {
        self.0.borrow().id
    }

    pub fn shape(&self) -> Vec<usize> {
        self.0.borrow().buf.shape.clone()
    }

    pub fn numel(&self) -> usize {
        self.0.borrow().buf.data.len()
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.0.borrow().buf.data.clone()
    }

    pub fn device(&self) -> Device {
        self.0.borrow().device
    }

    pub fn requires_grad(&self) -> bool {
        self.0.borrow().requires_grad
    }

    pub fn is_leaf(&self) -> bool {
        self.0.borrow().grad_fn.is_none()
    }

    /// Mark a leaf as trainable. Returns `self` for chaining.
    pub fn requires_grad_(self, requires_grad: bool) -> Self {
        self.0.borrow_mut().requires_grad = requires_grad;
        self
    }

    /// Accumulated gradient, as a new tensor on the same device.
    pub fn grad(&self) -> Option<Tensor> {
        let inner = self.0.borrow();
        inner
            .grad
            .as_ref()
            .map(|g| Tensor::from_buffer(g.clone(), inner.device))
    }

    pub fn zero_grad(&self) {
        self.0.borrow_mut().grad = None;
    }

    /// Same storage contents, cut off from the tape.
    pub fn detach(&self) -> Tensor {
        let inner = self.0.borrow();
        Tensor::from_buffer(inner.buf.clone(), inner.device)
    }

    /// Independent copy that keeps `requires_grad` but not the gradient.
    pub fn deep_clone(&self) -> Tensor {
        let copy = self.detach();
        copy.0.borrow_mut().requires_grad = self.requires_grad();
        copy
    }

    /// Overwrite this tensor's storage with `src`'s, keeping identity.
    pub fn copy_(&self, src: &Tensor) -> Result<()> {
        if Rc::ptr_eq(&self.0, &src.0) {
            return Ok(());
        }
        let data = src.0.borrow().buf.clone();
        let mut inner = self.0.borrow_mut();
        if inner.buf.shape != data.shape {
            return Err(DiffError::ShapeMismatch {
                op: "copy_",
                left: inner.buf.shape.clone(),
                right: data.shape,
            });
        }
        inner.buf = data;
        Ok(())
    }

    /// Move storage to `device` in place.
    pub fn move_to(&self, device: Device) -> Result<()> {
        check_available(device)?;
        let mut inner = self.0.borrow_mut();
        inner.device = device;
        Ok(())
    }

    /// Copy of this tensor on `device`.
    pub fn to_device(&self, device: Device) -> Result<Tensor> {
        check_available(device)?;
        let copy = self.deep_clone();
        copy.0.borrow_mut().device = device;
        Ok(copy)
    }

    pub(crate) fn buffer(&self) -> Buffer {
        self.0.borrow().buf.clone()
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut Buffer)) {
        f(&mut self.0.borrow_mut().buf);
    }

    pub(crate) fn grad_buffer(&self) -> Option<Buffer> {
        self.0.borrow().grad.clone()
    }

    pub(crate) fn set_grad_buffer(&self, grad: Option<Buffer>) {
        self.0.borrow_mut().grad = grad;
    }

    pub(crate) fn grad_fn(&self) -> Option<Rc<GradFn>> {
        self.0.borrow().grad_fn.clone()
    }

    /// Run `op` and, if grad mode is on and any input is trainable, record it.
    fn apply(op: DiffOp, inputs: &[&Tensor]) -> Result<Tensor> {
        debug_assert_eq!(inputs.len(), op.num_inputs());
        let device = inputs[0].device();
        for t in &inputs[1..] {
            if t.device() != device {
                return Err(DiffError::DeviceMismatch {
                    left: device,
                    right: t.device(),
                });
            }
        }

        let saved: Vec<Buffer> = inputs.iter().map(|t| t.buffer()).collect();
        let refs: Vec<&Buffer> = saved.iter().collect();
        let out = op.forward(&refs)?;
        let result = Tensor::from_buffer(out, device);

        if is_grad_enabled() && inputs.iter().any(|t| t.requires_grad()) {
            let grad_fn = GradFn {
                op,
                inputs: inputs.iter().map(|t| (*t).clone()).collect(),
                saved,
            };
            let mut inner = result.0.borrow_mut();
            inner.requires_grad = true;
            inner.grad_fn = Some(Rc::new(grad_fn));
        }
        Ok(result)
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        Self::apply(DiffOp::Add, &[self, other])
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        Self::apply(DiffOp::Sub, &[self, other])
    }

    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        Self::apply(DiffOp::Mul, &[self, other])
    }

    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        Self::apply(DiffOp::MatMul, &[self, other])
    }

    /// `self + bias`, with `bias` broadcast over rows.
    pub fn add_bias(&self, bias: &Tensor) -> Result<Tensor> {
        Self::apply(DiffOp::AddBias, &[self, bias])
    }

    pub fn relu(&self) -> Result<Tensor> {
        Self::apply(DiffOp::ReLU, &[self])
    }

    pub fn tanh(&self) -> Result<Tensor> {
        Self::apply(DiffOp::Tanh, &[self])
    }

    pub fn scale(&self, factor: f32) -> Result<Tensor> {
        Self::apply(DiffOp::Scale { factor }, &[self])
    }

    pub fn sum(&self) -> Result<Tensor> {
        Self::apply(DiffOp::Sum, &[self])
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        write!(
            f,
            "Tensor(id={}, shape={:?}, device={}, requires_grad={})",
            inner.id, inner.buf.shape, inner.device, inner.requires_grad
        )
    }
}
