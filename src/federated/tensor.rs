//! Dense weight tensor
//!
//! Only the elementwise operations aggregation needs. Shape mismatches are
//! validation errors rather than panics because weights arrive from clients.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Flat tensor of model weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    values: Vec<f64>,
}

impl Tensor {
    /// Wrap raw values.
    #[must_use]
    pub const fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    /// All-zero tensor of the given length.
    #[must_use]
    pub fn zeros(len: usize) -> Self {
        Self {
            values: vec![0.0; len],
        }
    }

    /// All-zero tensor shaped like `self`.
    #[must_use]
    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.len())
    }

    /// Raw values.
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the tensor has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Elementwise `self + other`.
    ///
    /// # Errors
    /// Returns `Validation` on length mismatch.
    pub fn add(&self, other: &Self) -> Result<Self> {
        self.zip_with(other, |a, b| a + b)
    }

    /// Elementwise `self - other`.
    ///
    /// # Errors
    /// Returns `Validation` on length mismatch.
    pub fn sub(&self, other: &Self) -> Result<Self> {
        self.zip_with(other, |a, b| a - b)
    }

    /// Multiply every element by `factor`.
    #[must_use]
    pub fn scale(&self, factor: f64) -> Self {
        self.map(|v| v * factor)
    }

    /// Elementwise square.
    #[must_use]
    pub fn square(&self) -> Self {
        self.map(|v| v * v)
    }

    /// Elementwise square root.
    #[must_use]
    pub fn sqrt(&self) -> Self {
        self.map(f64::sqrt)
    }

    pub(crate) fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            values: self.values.iter().copied().map(f).collect(),
        }
    }

    pub(crate) fn zip_with(&self, other: &Self, f: impl Fn(f64, f64) -> f64) -> Result<Self> {
        if self.len() != other.len() {
            return Err(Error::Validation(format!(
                "tensor length mismatch: {} vs {}",
                self.len(),
                other.len()
            )));
        }
        Ok(Self {
            values: self
                .values
                .iter()
                .zip(&other.values)
                .map(|(&a, &b)| f(a, b))
                .collect(),
        })
    }
}

impl From<Vec<f64>> for Tensor {
    fn from(values: Vec<f64>) -> Self {
        Self::new(values)
    }
}
