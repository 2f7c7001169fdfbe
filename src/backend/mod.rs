//! Array backend interface.
//!
//! The graph never touches array elements directly: every forward `compute`
//! goes through a [`Backend`] handle that the caller injects via
//! [`Context`](crate::graph::Context). This keeps the numeric implementation
//! swappable without global state.
//!
//! ## Submodules
//!
//! - [`cpu`]: Multi-threaded CPU implementation (the default backend)
//!
//! ## Broadcasting
//!
//! Binary operations follow NumPy broadcasting: shapes are aligned from the
//! right, each aligned pair of dimensions must be equal or contain a `1`, and
//! missing leading dimensions behave like `1`. See [`broadcast_shapes`].
//!
//! ## Extending the Backend
//!
//! A new backend implements every required method of [`Backend`]. The
//! provided methods (`ones`, `eye`, `one_hot`) only build constants and rarely
//! need overriding.

use crate::array::NdArray;
use crate::error::{AutogradError, Result};
use core::fmt;

pub mod cpu;

pub use self::cpu::CpuBackend;

/// Element-wise binary operations with broadcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `lhs + rhs`
    Add,
    /// `lhs * rhs`
    Mul,
    /// `lhs / rhs`
    Div,
}

impl BinaryOp {
    /// Applies the operation to one pair of elements.
    #[inline]
    #[must_use]
    pub fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            Self::Add => lhs + rhs,
            Self::Mul => lhs * rhs,
            Self::Div => lhs / rhs,
        }
    }

    /// Name used in error messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Mul => "multiply",
            Self::Div => "divide",
        }
    }
}

/// Operations between every element and one scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarOp {
    /// `x + s`
    Add,
    /// `x * s`
    Mul,
    /// `x / s`
    Div,
    /// `max(x, s)`
    Maximum,
}

impl ScalarOp {
    /// Applies the operation to one element.
    #[inline]
    #[must_use]
    pub fn apply(self, x: f64, s: f64) -> f64 {
        match self {
            Self::Add => x + s,
            Self::Mul => x * s,
            Self::Div => x / s,
            Self::Maximum => x.max(s),
        }
    }
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `-x`
    Neg,
    /// natural logarithm
    Log,
    /// `e^x`
    Exp,
}

impl UnaryOp {
    /// Applies the operation to one element.
    #[inline]
    #[must_use]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Self::Neg => -x,
            Self::Log => x.ln(),
            Self::Exp => x.exp(),
        }
    }
}

/// Numeric array routines consumed by the autograd core.
///
/// Every method is pure: it reads its operands and returns a new array.
pub trait Backend: fmt::Debug + Send + Sync {
    /// Short identifier, e.g. `"cpu"`.
    fn name(&self) -> &'static str;

    /// Element-wise `lhs op rhs` with broadcasting.
    ///
    /// # Errors
    ///
    /// [`AutogradError::ShapeMismatch`] if the shapes cannot be broadcast together.
    fn binary(&self, op: BinaryOp, lhs: &NdArray, rhs: &NdArray) -> Result<NdArray>;

    /// Element-wise `x op scalar`.
    fn scalar(&self, op: ScalarOp, x: &NdArray, scalar: f64) -> NdArray;

    /// Element-wise unary function.
    fn unary(&self, op: UnaryOp, x: &NdArray) -> NdArray;

    /// Element-wise integer power.
    fn powi(&self, x: &NdArray, exponent: i32) -> NdArray;

    /// `1.0` where `x > 0`, else `0.0`.
    fn positive_mask(&self, x: &NdArray) -> NdArray;

    /// Sums over `axes`, removing them from the shape.
    ///
    /// `None` reduces every axis to a rank-0 array; an empty slice returns
    /// the input unchanged.
    ///
    /// # Errors
    ///
    /// [`AutogradError::ShapeMismatch`] for an out-of-range or repeated axis.
    fn sum(&self, x: &NdArray, axes: Option<&[usize]>) -> Result<NdArray>;

    /// Broadcasts `x` to `shape`.
    ///
    /// # Errors
    ///
    /// [`AutogradError::ShapeMismatch`] if `x` is not broadcastable to `shape`.
    fn broadcast_to(&self, x: &NdArray, shape: &[usize]) -> Result<NdArray>;

    /// Reinterprets `x` with a new shape of the same element count.
    ///
    /// # Errors
    ///
    /// [`AutogradError::ShapeMismatch`] if the element counts differ.
    fn reshape(&self, x: &NdArray, shape: &[usize]) -> Result<NdArray>;

    /// Reorders axes: output axis `i` is input axis `axes[i]`.
    ///
    /// # Errors
    ///
    /// [`AutogradError::ShapeMismatch`] unless `axes` is a permutation of `0..ndim`.
    fn permute(&self, x: &NdArray, axes: &[usize]) -> Result<NdArray>;

    /// Matrix product over the last two axes, broadcasting leading batch axes.
    ///
    /// # Errors
    ///
    /// [`AutogradError::ShapeMismatch`] if either operand has rank below 2, the
    /// inner dimensions differ, or the batch dimensions cannot be broadcast.
    fn matmul(&self, lhs: &NdArray, rhs: &NdArray) -> Result<NdArray>;

    /// An array of ones.
    fn ones(&self, shape: &[usize]) -> NdArray {
        NdArray::ones(shape)
    }

    /// The `n × n` identity matrix.
    fn eye(&self, n: usize) -> NdArray {
        NdArray::eye(n)
    }

    /// One row per label with a `1.0` in the label's column.
    ///
    /// Row `i` is row `labels[i]` of [`Backend::eye`]`(classes)`.
    ///
    /// # Errors
    ///
    /// [`AutogradError::ShapeMismatch`] if a label is not below `classes`.
    fn one_hot(&self, labels: &[usize], classes: usize) -> Result<NdArray> {
        let eye = self.eye(classes);
        let mut data = Vec::with_capacity(labels.len() * classes);
        for &label in labels {
            if label >= classes {
                return Err(AutogradError::shape(
                    "one_hot",
                    format!("label {label} is out of range for {classes} classes"),
                ));
            }
            data.extend_from_slice(&eye.data()[label * classes..(label + 1) * classes]);
        }
        NdArray::new(vec![labels.len(), classes], data)
    }
}

/// Shape that `lhs` and `rhs` broadcast to.
///
/// # Errors
///
/// [`AutogradError::ShapeMismatch`] when an aligned pair of dimensions differs
/// and neither is `1`.
pub fn broadcast_shapes(lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>> {
    let ndim = lhs.len().max(rhs.len());
    let mut out = vec![0; ndim];
    for i in 0..ndim {
        let l = dim_from_right(lhs, ndim - 1 - i);
        let r = dim_from_right(rhs, ndim - 1 - i);
        out[i] = match (l, r) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => {
                return Err(AutogradError::shape(
                    "broadcast",
                    format!("cannot broadcast {lhs:?} with {rhs:?}"),
                ));
            }
        };
    }
    Ok(out)
}

/// Dimension `offset` places from the right, or `1` if `shape` is too short.
fn dim_from_right(shape: &[usize], offset: usize) -> usize {
    shape
        .len()
        .checked_sub(offset + 1)
        .map_or(1, |idx| shape[idx])
}
