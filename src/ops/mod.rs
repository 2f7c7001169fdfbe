//! # Differentiable Operators
//!
//! Every node that is not a leaf records the [`Operator`] that produced it.
//! An operator has two halves:
//!
//! 1. **Forward**: [`Operator::compute`] maps concrete input arrays to the
//!    output array through the injected [`Backend`]. It never sees graph nodes.
//! 2. **Backward**: [`Operator::gradient`] receives the gradient flowing into
//!    the node's output and the node itself, and returns one gradient per
//!    input, built from further tensor operations. Gradients are therefore
//!    graphs too.
//!
//! ## Submodules
//!
//! - [`elementwise`]: arithmetic, scalar arithmetic, `log`, `exp`, `relu`
//! - [`shape`]: transpose, reshape, broadcast, summation
//! - [`matmul`]: batched matrix multiplication
//!
//! ## Extending
//!
//! A new operator is a type implementing [`Operator`], applied with
//! [`Tensor::from_op`]. Its gradient must return exactly `arity()` tensors,
//! each shaped like the matching input; the backward engine rejects anything
//! else.

use crate::array::NdArray;
use crate::backend::Backend;
use crate::error::{AutogradError, Result};
use crate::tensor::Tensor;
use core::fmt;

pub mod elementwise;
pub mod matmul;
pub mod shape;

pub use self::elementwise::{
    AddScalar, DivScalar, EWiseAdd, EWiseDiv, EWiseMul, Exp, Log, MulScalar, Negate, PowerScalar,
    ReLU,
};
pub use self::matmul::MatMul;
pub use self::shape::{BroadcastTo, Reshape, Summation, Transpose};

/// Forward computation plus backward gradient rule of one mathematical operation.
pub trait Operator: fmt::Debug + Send + Sync {
    /// Short identifier used in errors and logs.
    fn name(&self) -> &'static str;

    /// Number of inputs the operator consumes.
    fn arity(&self) -> usize;

    /// Computes the output array from the input arrays.
    ///
    /// # Errors
    ///
    /// [`AutogradError::ShapeMismatch`] when the inputs violate the operator's contract.
    fn compute(&self, backend: &dyn Backend, inputs: &[&NdArray]) -> Result<NdArray>;

    /// One gradient per input of `node`, given the gradient of `node`'s output.
    ///
    /// # Errors
    ///
    /// [`AutogradError::NotImplemented`] unless overridden, or any error
    /// raised while building the gradient graph.
    fn gradient(&self, out_grad: &Tensor, node: &Tensor) -> Result<Vec<Tensor>> {
        let _ = (out_grad, node);
        Err(AutogradError::NotImplemented(self.name()))
    }
}

/// The `i`-th input of `node`.
pub(crate) fn input(node: &Tensor, i: usize) -> Result<&Tensor> {
    node.inputs().get(i).ok_or_else(|| AutogradError::UnrealizedValue {
        id: node.id(),
        reason: format!("missing input {i}"),
    })
}

/// `inputs[i]` for a forward computation.
pub(crate) fn arg<'a>(op: &'static str, inputs: &[&'a NdArray], i: usize) -> Result<&'a NdArray> {
    inputs.get(i).copied().ok_or_else(|| {
        AutogradError::shape(op, format!("expected input {i}, got {} inputs", inputs.len()))
    })
}

/// Reduces a broadcast gradient back to `shape`.
///
/// Sums over every leading axis `grad` has beyond `shape` and over every axis
/// where `shape` is 1 but `grad` is not, then reshapes to `shape`. A gradient
/// already shaped like `shape` is returned as is.
///
/// # Errors
///
/// [`AutogradError::ShapeMismatch`] if `shape` could not have been broadcast to
/// the gradient's shape.
pub fn sum_to_shape(grad: &Tensor, shape: &[usize]) -> Result<Tensor> {
    let grad_shape = grad.shape()?.to_vec();
    if grad_shape == shape {
        return Ok(grad.clone());
    }
    let mismatch = || {
        AutogradError::shape(
            "broadcast_to",
            format!("gradient of shape {grad_shape:?} cannot reduce to {shape:?}"),
        )
    };

    let lead = grad_shape.len().checked_sub(shape.len()).ok_or_else(mismatch)?;
    let mut axes: Vec<usize> = (0..lead).collect();
    for (i, (&want, &have)) in shape.iter().zip(&grad_shape[lead..]).enumerate() {
        if want == have {
            continue;
        }
        if want != 1 {
            return Err(mismatch());
        }
        axes.push(lead + i);
    }

    let reduced = if axes.is_empty() {
        grad.clone()
    } else {
        grad.sum(Some(axes.as_slice()))?
    };
    reduced.reshape(shape)
}
