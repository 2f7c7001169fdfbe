//! Dense n-dimensional arrays backing every graph node.
//!
//! # Layout
//!
//! An [`NdArray`] stores its shape as a `Vec<usize>` and its elements as a flat,
//! row-major `Vec<f64>`. Rank-0 arrays (scalars) have shape `[]` and exactly one
//! element.
//!
//! Arrays are plain values: once a graph node publishes one as its cached value
//! it is only ever read, and every kernel in [`crate::backend`] returns a fresh
//! array instead of writing into its operands.
//!
//! ## Example
//!
//! ```rust
//! use briny_grad::array::NdArray;
//! let a = NdArray::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
//! assert_eq!(a.shape(), &[2, 3]);
//! assert_eq!(a.len(), 6);
//! ```

use crate::approx::{ApproxEquality, RelativeEq};
use crate::error::{AutogradError, Result};
use core::fmt;

/// Element type of an array.
///
/// Every array in this crate holds `f64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum DType {
    /// IEEE-754 double precision.
    #[default]
    Float64,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float64 => f.write_str("float64"),
        }
    }
}

/// Dense row-major array of `f64`.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl NdArray {
    /// Creates an array with the given shape and flat row-major data.
    ///
    /// # Errors
    ///
    /// [`AutogradError::ShapeMismatch`] if `data.len()` is not the product of `shape`.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<f64>) -> Result<Self> {
        let shape = shape.into();
        let expected = numel(&shape);
        if expected != data.len() {
            return Err(AutogradError::shape(
                "array",
                format!(
                    "shape {shape:?} needs {expected} elements, got {}",
                    data.len()
                ),
            ));
        }
        Ok(Self { shape, data })
    }

    /// Builds an array whose shape has already been checked against its data.
    pub(crate) fn from_parts(shape: Vec<usize>, data: Vec<f64>) -> Self {
        debug_assert_eq!(numel(&shape), data.len());
        Self { shape, data }
    }

    /// A rank-0 array holding `value`.
    #[must_use]
    pub fn scalar(value: f64) -> Self {
        Self::from_parts(Vec::new(), vec![value])
    }

    /// A rank-1 array over `data`.
    #[must_use]
    pub fn from_vec(data: Vec<f64>) -> Self {
        Self::from_parts(vec![data.len()], data)
    }

    /// An array of the given shape filled with `value`.
    #[must_use]
    pub fn full(shape: &[usize], value: f64) -> Self {
        Self::from_parts(shape.to_vec(), vec![value; numel(shape)])
    }

    /// An array of zeros.
    #[must_use]
    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    /// An array of ones.
    #[must_use]
    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, 1.0)
    }

    /// The `n × n` identity matrix.
    #[must_use]
    pub fn eye(n: usize) -> Self {
        let mut data = vec![0.0; n * n];
        for i in 0..n {
            data[i * n + i] = 1.0;
        }
        Self::from_parts(vec![n, n], data)
    }

    /// Dimensions of the array.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Flat row-major elements.
    #[must_use]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Consumes the array, returning its flat elements.
    #[must_use]
    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    /// Number of dimensions.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the array holds no elements (some dimension is zero).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Element type.
    #[must_use]
    pub const fn dtype(&self) -> DType {
        DType::Float64
    }

    /// The single element of a one-element array.
    ///
    /// # Errors
    ///
    /// [`AutogradError::ShapeMismatch`] if the array does not hold exactly one element.
    pub fn item(&self) -> Result<f64> {
        match self.data.as_slice() {
            [value] => Ok(*value),
            _ => Err(AutogradError::shape(
                "item",
                format!("expected a single element, got shape {:?}", self.shape),
            )),
        }
    }

    /// Index of the largest element of each row of a rank-2 array.
    ///
    /// Ties resolve to the first maximum.
    ///
    /// # Errors
    ///
    /// [`AutogradError::ShapeMismatch`] unless the array is rank 2.
    pub fn argmax_rows(&self) -> Result<Vec<usize>> {
        let &[rows, cols] = self.shape.as_slice() else {
            return Err(AutogradError::shape(
                "argmax_rows",
                format!("expected a rank-2 array, got shape {:?}", self.shape),
            ));
        };
        if cols == 0 {
            return Ok(vec![0; rows]);
        }
        Ok(self
            .data
            .chunks(cols)
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f64::NEG_INFINITY), |best, (i, &x)| {
                        if x > best.1 { (i, x) } else { best }
                    })
                    .0
            })
            .collect())
    }

    /// Copies rows `start..end` along the leading axis; `end` is clamped to the row count.
    ///
    /// # Errors
    ///
    /// [`AutogradError::ShapeMismatch`] for rank-0 arrays or `start > end`.
    pub fn slice_rows(&self, start: usize, end: usize) -> Result<Self> {
        let Some((&rows, rest)) = self.shape.split_first() else {
            return Err(AutogradError::shape(
                "slice_rows",
                "cannot slice a rank-0 array",
            ));
        };
        let end = end.min(rows);
        if start > end {
            return Err(AutogradError::shape(
                "slice_rows",
                format!("row range {start}..{end} is empty or reversed"),
            ));
        }
        let row_len = numel(rest);
        let mut shape = self.shape.clone();
        shape[0] = end - start;
        Ok(Self::from_parts(
            shape,
            self.data[start * row_len..end * row_len].to_vec(),
        ))
    }

    /// Whether `other` has the same shape and every element is within `tolerance`.
    #[must_use]
    pub fn all_close(&self, other: &Self, tolerance: ApproxEquality) -> bool {
        self.approx_eq(other) <= tolerance
    }

    /// Stacks equally shaped arrays along a new leading axis.
    ///
    /// Used by [`array!`](crate::array!) for nested literals.
    ///
    /// # Panics
    ///
    /// Panics if the children do not all share one shape.
    #[doc(hidden)]
    #[must_use]
    pub fn stack_literal(children: Vec<Self>) -> Self {
        let inner = children.first().map(|c| c.shape.clone()).unwrap_or_default();
        assert!(
            children.iter().all(|c| c.shape == inner),
            "ragged array literal (rows have mismatched shapes)"
        );
        let mut shape = vec![children.len()];
        shape.extend_from_slice(&inner);
        let data = children.into_iter().flat_map(|c| c.data).collect();
        Self::from_parts(shape, data)
    }
}

impl RelativeEq<Self> for NdArray {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        if self.shape != rhs.shape {
            return ApproxEquality::Scarce;
        }
        self.data.as_slice().approx_eq(rhs.data.as_slice())
    }
}

/// Number of elements described by `shape` (1 for rank 0).
#[must_use]
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Row-major strides of `shape`, in elements.
#[must_use]
pub fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Defines an [`NdArray`] from nested literal arrays.
///
/// Supports arbitrary rank as long as sublists are uniform in shape.
///
/// # Example
/// ```
/// use briny_grad::array;
/// let a = array!([[1.0, 2.0], [3.0, -4.0]]);
/// assert_eq!(a.shape(), &[2, 2]);
/// let s = array!(3.5);
/// assert_eq!(s.shape(), &[] as &[usize]);
/// ```
#[macro_export]
macro_rules! array {
    ([ $( [ $($inner:tt)* ] ),+ $(,)? ]) => {
        $crate::array::NdArray::stack_literal(vec![ $( $crate::array!([ $($inner)* ]) ),+ ])
    };

    ([ $( $x:expr ),* $(,)? ]) => {
        $crate::array::NdArray::from_vec(vec![ $( ($x) as f64 ),* ])
    };

    ($x:expr) => {
        $crate::array::NdArray::scalar(($x) as f64)
    };
}
