//! # Native Arrays
//!
//! `Array` is the orchestrator's own array type. Layers written against graft
//! consume and produce `Array`s; foreign frameworks convert to and from it at
//! their boundary, so nothing on this side ever holds a foreign tensor.
//!
//! | Op | Result |
//! |----|--------|
//! | `add` / `sub` / `mul` | elementwise, shapes must match |
//! | `matmul` | `(m,k) @ (k,n) -> (m,n)` |
//! | `sum` / `mean` / `norm` | scalar reductions |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A dense row-major `f32` array with a dynamic shape.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Array {
    /// Dimension sizes (empty = scalar)
    pub shape: Vec<usize>,
    /// Flattened data in row-major order
    pub data: Vec<f32>,
}

impl Array {
    /// Create an array filled with zeros.
    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::full(shape, 0.0)
    }

    /// Create an array filled with a constant value.
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            data: vec![value; size],
        }
    }

    /// Create an array from data with the given shape.
    pub fn from_shape_vec(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, CoreError> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(CoreError::DataLength {
                len: data.len(),
                shape,
            });
        }
        Ok(Self { shape, data })
    }

    /// Create a scalar array.
    pub fn scalar(value: f32) -> Self {
        Self {
            shape: vec![],
            data: vec![value],
        }
    }

    /// Create a 1D array.
    pub fn vector(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    /// Create a 2D array. Panics if `data` has the wrong length.
    pub fn matrix(rows: usize, cols: usize, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), rows * cols, "matrix data length");
        Self {
            shape: vec![rows, cols],
            data,
        }
    }

    /// Normal samples scaled by `scale`, reproducible for a given seed.
    pub fn randn_seeded(shape: Vec<usize>, scale: f32, seed: u64) -> Self {
        let size: usize = shape.iter().product();
        let mut data = Vec::with_capacity(size);
        let mut state = seed;
        for _ in 0..size {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            let u1 = ((state >> 11) as f32 / (1u64 << 53) as f32).max(1e-10);
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            let u2 = (state >> 11) as f32 / (1u64 << 53) as f32;
            let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos();
            data.push(z * scale);
        }
        Self { shape, data }
    }

    /// Total number of elements.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn zeros_like(&self) -> Array {
        Array::zeros(self.shape.clone())
    }

    fn check_same_shape(&self, other: &Array, op: &'static str) -> Result<(), CoreError> {
        if self.shape != other.shape {
            return Err(CoreError::ShapeMismatch {
                op,
                left: self.shape.clone(),
                right: other.shape.clone(),
            });
        }
        Ok(())
    }

    fn zip_with(
        &self,
        other: &Array,
        op: &'static str,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<Array, CoreError> {
        self.check_same_shape(other, op)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(&a, &b)| f(a, b))
            .collect();
        Ok(Array {
            shape: self.shape.clone(),
            data,
        })
    }

    /// Elementwise addition.
    pub fn add(&self, other: &Array) -> Result<Array, CoreError> {
        self.zip_with(other, "add", |a, b| a + b)
    }

    /// Elementwise subtraction.
    pub fn sub(&self, other: &Array) -> Result<Array, CoreError> {
        self.zip_with(other, "sub", |a, b| a - b)
    }

    /// Elementwise multiplication.
    pub fn mul(&self, other: &Array) -> Result<Array, CoreError> {
        self.zip_with(other, "mul", |a, b| a * b)
    }

    /// In-place `self += alpha * other`.
    pub fn axpy(&mut self, alpha: f32, other: &Array) -> Result<(), CoreError> {
        self.check_same_shape(other, "axpy")?;
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += alpha * b;
        }
        Ok(())
    }

    /// Scalar multiplication.
    pub fn scale(&self, scalar: f32) -> Array {
        self.map(|x| x * scalar)
    }

    /// Apply a function to each element.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Array {
        Array {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&x| f(x)).collect(),
        }
    }

    /// Matrix multiplication (2D arrays only).
    pub fn matmul(&self, other: &Array) -> Result<Array, CoreError> {
        if self.shape.len() != 2 || other.shape.len() != 2 || self.shape[1] != other.shape[0] {
            return Err(CoreError::ShapeMismatch {
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
        Ok(Array {
            shape: vec![m, n],
            data: result,
        })
    }

    /// Transpose a 2D array.
    pub fn transpose(&self) -> Result<Array, CoreError> {
        if self.shape.len() != 2 {
            return Err(CoreError::ShapeMismatch {
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
        Ok(Array {
            shape: vec![cols, rows],
            data: result,
        })
    }

    /// Sum of all elements.
    pub fn sum(&self) -> f32 {
        self.data.iter().sum()
    }

    /// Mean of all elements.
    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.sum() / self.data.len() as f32
    }

    /// L2 norm.
    pub fn norm(&self) -> f32 {
        self.data.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// True if every element is finite.
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }

    /// Index of the largest element in each row of a 2D array.
    pub fn argmax_rows(&self) -> Vec<usize> {
        let cols = self.shape.last().copied().unwrap_or(1).max(1);
        self.data
            .chunks(cols)
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                        if v > best.1 {
                            (i, v)
                        } else {
                            best
                        }
                    })
                    .0
            })
            .collect()
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.shape.is_empty() {
            write!(f, "Array(scalar={})", self.data[0])
        } else {
            write!(f, "Array(shape={:?}, data={:?})", self.shape, self.data)
        }
    }
}
