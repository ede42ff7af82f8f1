//! # Differentiable Operations
//!
//! [`Buffer`] is raw storage: a shape and a flat `f32` vector. [`DiffOp`] is
//! the set of operations the tape records. Each operation knows how to:
//!
//! - Execute forward (compute the output buffer from input buffers)
//! - Compute its VJP (vector-Jacobian product) for the backward pass
//!
//! | Op | Forward | Backward |
//! |----|---------|----------|
//! | Add | a + b | grad flows to both |
//! | Sub | a - b | grad, -grad |
//! | Mul | a * b | grad·b, grad·a |
//! | MatMul | A @ B | grad @ Bᵀ, Aᵀ @ grad |
//! | AddBias | X + b (row broadcast) | grad, column sums of grad |
//! | ReLU | max(0, x) | grad × (x > 0) |
//! | Tanh | tanh(x) | grad × (1 - tanh²) |
//! | Scale | c·x | c·grad |
//! | Sum | Σx | broadcast grad |

use std::fmt;

use crate::error::{DiffError, Result};

/// Flat row-major storage.
#[derive(Clone, PartialEq)]
pub struct Buffer {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Buffer {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected = shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d));
        if expected != Some(data.len()) {
            return Err(DiffError::ShapeMismatch {
                op: "from_vec",
                left: shape,
                right: vec![data.len()],
            });
        }
        Ok(Self { shape, data })
    }

    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            data: vec![value; size],
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self::full(self.shape.clone(), 0.0)
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&x| f(x)).collect(),
        }
    }

    pub fn zip(&self, other: &Buffer, op: &'static str, f: impl Fn(f32, f32) -> f32) -> Result<Self> {
        if self.shape != other.shape {
            return Err(DiffError::ShapeMismatch {
                op,
                left: self.shape.clone(),
                right: other.shape.clone(),
            });
        }
        Ok(Self {
            shape: self.shape.clone(),
            data: self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(&a, &b)| f(a, b))
                .collect(),
        })
    }

    /// In-place accumulate.
    pub fn add_assign(&mut self, other: &Buffer) -> Result<()> {
        if self.shape != other.shape {
            return Err(DiffError::ShapeMismatch {
                op: "accumulate",
                left: self.shape.clone(),
                right: other.shape.clone(),
            });
        }
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += b;
        }
        Ok(())
    }

    pub fn matmul(&self, other: &Buffer) -> Result<Self> {
        if self.shape.len() != 2 || other.shape.len() != 2 || self.shape[1] != other.shape[0] {
            return Err(DiffError::ShapeMismatch {
                op: "matmul",
                left: self.shape.clone(),
                right: other.shape.clone(),
            });
        }
        let (m, k, n) = (self.shape[0], self.shape[1], other.shape[1]);
        let mut result = vec![0.0; m * n];
        for i in 0..m {
            for kk in 0..k {
                let a = self.data[i * k + kk];
                for j in 0..n {
                    result[i * n + j] += a * other.data[kk * n + j];
                }
            }
        }
        Ok(Self {
            shape: vec![m, n],
            data: result,
        })
    }

    pub fn transpose(&self) -> Result<Self> {
        if self.shape.len() != 2 {
            return Err(DiffError::ShapeMismatch {
                op: "transpose",
                left: self.shape.clone(),
                right: vec![],
            });
        }
        let (rows, cols) = (self.shape[0], self.shape[1]);
        let mut result = vec![0.0; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                result[j * rows + i] = self.data[i * cols + j];
            }
        }
        Ok(Self {
            shape: vec![cols, rows],
            data: result,
        })
    }

    /// Sum a `(rows, cols)` buffer down to `(cols,)`.
    fn sum_rows(&self) -> Self {
        let cols = self.shape.last().copied().unwrap_or(1).max(1);
        let mut out = vec![0.0; cols];
        for row in self.data.chunks(cols) {
            for (o, v) in out.iter_mut().zip(row) {
                *o += v;
            }
        }
        Self {
            shape: vec![cols],
            data: out,
        }
    }

    pub fn sq_norm(&self) -> f32 {
        self.data.iter().map(|x| x * x).sum()
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer(shape={:?}, data={:?})", self.shape, self.data)
    }
}

/// Operations recorded on the tape.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffOp {
    Add,
    Sub,
    Mul,
    MatMul,
    /// `(n, k) + (k,)`, bias broadcast over rows
    AddBias,
    ReLU,
    Tanh,
    Scale { factor: f32 },
    /// Sum all elements to a scalar
    Sum,
}

impl DiffOp {
    /// Execute the forward pass for this operation.
    pub fn forward(&self, inputs: &[&Buffer]) -> Result<Buffer> {
        match self {
            DiffOp::Add => inputs[0].zip(inputs[1], "add", |a, b| a + b),
            DiffOp::Sub => inputs[0].zip(inputs[1], "sub", |a, b| a - b),
            DiffOp::Mul => inputs[0].zip(inputs[1], "mul", |a, b| a * b),
            DiffOp::MatMul => inputs[0].matmul(inputs[1]),
            DiffOp::AddBias => {
                let (x, bias) = (inputs[0], inputs[1]);
                let cols = x.shape.last().copied().unwrap_or(0);
                if bias.shape != [cols] {
                    return Err(DiffError::ShapeMismatch {
                        op: "add_bias",
                        left: x.shape.clone(),
                        right: bias.shape.clone(),
                    });
                }
                let mut out = x.clone();
                for row in out.data.chunks_mut(cols.max(1)) {
                    for (o, b) in row.iter_mut().zip(bias.data.iter()) {
                        *o += b;
                    }
                }
                Ok(out)
            }
            DiffOp::ReLU => Ok(inputs[0].map(|x| x.max(0.0))),
            DiffOp::Tanh => Ok(inputs[0].map(f32::tanh)),
            DiffOp::Scale { factor } => Ok(inputs[0].map(|x| x * factor)),
            DiffOp::Sum => Ok(Buffer {
                shape: vec![],
                data: vec![inputs[0].data.iter().sum()],
            }),
        }
    }

    /// Number of inputs this operation expects.
    pub fn num_inputs(&self) -> usize {
        match self {
            DiffOp::Add | DiffOp::Sub | DiffOp::Mul | DiffOp::MatMul | DiffOp::AddBias => 2,
            DiffOp::ReLU | DiffOp::Tanh | DiffOp::Scale { .. } | DiffOp::Sum => 1,
        }
    }

    /// Compute the VJP: given the forward inputs and the gradient of the
    /// loss with respect to the output, return one gradient per input.
    pub fn vjp(&self, inputs: &[Buffer], grad: &Buffer) -> Result<Vec<Buffer>> {
        Ok(match self {
            DiffOp::Add => vec![grad.clone(), grad.clone()],
            DiffOp::Sub => vec![grad.clone(), grad.map(|g| -g)],
            DiffOp::Mul => {
                let (x, y) = (&inputs[0], &inputs[1]);
                vec![grad.zip(y, "mul vjp", |g, b| g * b)?, grad.zip(x, "mul vjp", |g, a| g * a)?]
            }
            DiffOp::MatMul => {
                // ∂L/∂A = (∂L/∂C) @ Bᵀ, ∂L/∂B = Aᵀ @ (∂L/∂C)
                let (a, b) = (&inputs[0], &inputs[1]);
                vec![grad.matmul(&b.transpose()?)?, a.transpose()?.matmul(grad)?]
            }
            DiffOp::AddBias => vec![grad.clone(), grad.sum_rows()],
            DiffOp::ReLU => {
                vec![grad.zip(&inputs[0], "relu vjp", |g, x| if x > 0.0 { g } else { 0.0 })?]
            }
            DiffOp::Tanh => vec![grad.zip(&inputs[0], "tanh vjp", |g, x| {
                let t = x.tanh();
                g * (1.0 - t * t)
            })?],
            DiffOp::Scale { factor } => vec![grad.map(|g| g * factor)],
            DiffOp::Sum => vec![Buffer::full(inputs[0].shape.clone(), grad.data[0])],
        })
    }
}

impl fmt::Display for DiffOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffOp::Scale { factor } => write!(f, "Scale({})", factor),
            other => write!(f, "{:?}", other),
        }
    }
}
