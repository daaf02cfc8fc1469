//! Tensor implementation
//!
//! This module provides the core `Tensor` type: an N-dimensional array in
//! row-major order. Attention tensors in this crate are 4-D, laid out as
//! `[batch, head, position, channel]` on the kernel side.

use std::fmt;

use num_traits::Num;
use serde::{Deserialize, Serialize};

use crate::error::{EsparsoError, Result};

/// N-dimensional row-major tensor
///
/// # Examples
///
/// ```
/// use esparso::Tensor;
///
/// // Create a 2×3 tensor
/// let t = Tensor::from_vec(vec![2, 3], vec![
///     1.0, 2.0, 3.0,
///     4.0, 5.0, 6.0,
/// ]).unwrap();
///
/// assert_eq!(t.shape(), &[2, 3]);
/// assert_eq!(t.ndim(), 2);
/// assert_eq!(t.size(), 6);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tensor<T: Num> {
    /// Flattened data in row-major order
    data: Vec<T>,
    /// Shape of the tensor
    shape: Vec<usize>,
}

impl<T: Num + Clone> Tensor<T> {
    /// Create a new tensor from a vector and shape
    ///
    /// # Arguments
    ///
    /// * `shape` - Dimensions of the tensor
    /// * `data` - Flattened data in row-major order
    ///
    /// # Errors
    ///
    /// Returns `Err` if:
    /// - Shape is empty
    /// - Shape contains zero
    /// - Data size doesn't match shape
    pub fn from_vec(shape: Vec<usize>, data: Vec<T>) -> Result<Self> {
        if shape.is_empty() {
            return Err(EsparsoError::InvalidShape {
                reason: "Shape cannot be empty".to_string(),
            });
        }

        if shape.contains(&0) {
            return Err(EsparsoError::InvalidShape {
                reason: "Shape dimensions cannot be zero".to_string(),
            });
        }

        let expected_size = shape.iter().product();

        if data.len() != expected_size {
            return Err(EsparsoError::DataShapeMismatch {
                data_size: data.len(),
                shape: shape.clone(),
                expected: expected_size,
            });
        }

        Ok(Self { data, shape })
    }

    /// Create a zero-filled tensor of the given shape
    ///
    /// # Errors
    ///
    /// Returns `Err` if the shape is empty or contains zero.
    ///
    /// # Examples
    ///
    /// ```
    /// use esparso::Tensor;
    ///
    /// let t = Tensor::<f32>::zeros(vec![2, 4]).unwrap();
    /// assert_eq!(t.size(), 8);
    /// assert!(t.data().iter().all(|&x| x == 0.0));
    /// ```
    pub fn zeros(shape: Vec<usize>) -> Result<Self> {
        let size = shape.iter().product();
        Self::from_vec(shape, vec![T::zero(); size])
    }

    /// Get the shape of the tensor
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the number of dimensions
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Get the total number of elements
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Get a reference to the underlying data
    #[must_use]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Get a mutable reference to the underlying data
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Consume the tensor and return its flattened data
    #[must_use]
    pub fn into_data(self) -> Vec<T> {
        self.data
    }
}

impl<T: Num + Clone> Tensor<T> {
    /// Flat offset of `[b, h, 0, 0]` in a 4-D `[batch, head, position,
    /// channel]` tensor
    ///
    /// Debug-asserts that the tensor is 4-D and the indices are in range;
    /// callers validate shapes before entering their compute loops.
    #[must_use]
    pub(crate) fn plane_offset(&self, b: usize, h: usize) -> usize {
        debug_assert_eq!(self.shape.len(), 4);
        debug_assert!(b < self.shape[0] && h < self.shape[1]);
        (b * self.shape[1] + h) * self.shape[2] * self.shape[3]
    }
}

impl<T: Num + Clone + fmt::Display> fmt::Display for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(shape={:?}, data=[", self.shape)?;
        for (i, val) in self.data.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{val}")?;
        }
        write!(f, "])")
    }
}
