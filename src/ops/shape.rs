//! Operators that move or reduce elements without arithmetic on them.

use super::{Operator, arg, input, sum_to_shape};
use crate::array::NdArray;
use crate::backend::Backend;
use crate::error::{AutogradError, Result};
use crate::tensor::Tensor;

/// Swaps two axes; the last two when `axes` is `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Transpose {
    /// The pair of axes to swap.
    pub axes: Option<(usize, usize)>,
}

impl Transpose {
    /// The full axis permutation for a rank-`ndim` input.
    fn permutation(&self, ndim: usize) -> Result<Vec<usize>> {
        let (i, j) = match self.axes {
            None if ndim < 2 => {
                return Err(AutogradError::shape(
                    "transpose",
                    format!("default axes need rank >= 2, got rank {ndim}"),
                ));
            }
            None => (ndim - 2, ndim - 1),
            Some((i, j)) if i >= ndim || j >= ndim => {
                return Err(AutogradError::shape(
                    "transpose",
                    format!("axes ({i}, {j}) are out of range for rank {ndim}"),
                ));
            }
            Some(pair) => pair,
        };
        let mut perm: Vec<usize> = (0..ndim).collect();
        perm.swap(i, j);
        Ok(perm)
    }
}

impl Operator for Transpose {
    fn name(&self) -> &'static str {
        "transpose"
    }

    fn arity(&self) -> usize {
        1
    }

    fn compute(&self, backend: &dyn Backend, inputs: &[&NdArray]) -> Result<NdArray> {
        let x = arg(self.name(), inputs, 0)?;
        backend.permute(x, &self.permutation(x.ndim())?)
    }

    fn gradient(&self, out_grad: &Tensor, _node: &Tensor) -> Result<Vec<Tensor>> {
        // a swap is its own inverse
        Ok(vec![out_grad.transpose(self.axes)?])
    }
}

/// Same elements, new shape.
#[derive(Debug, Clone, Default)]
pub struct Reshape {
    /// Target shape; must hold the same number of elements.
    pub shape: Vec<usize>,
}

impl Operator for Reshape {
    fn name(&self) -> &'static str {
        "reshape"
    }

    fn arity(&self) -> usize {
        1
    }

    fn compute(&self, backend: &dyn Backend, inputs: &[&NdArray]) -> Result<NdArray> {
        backend.reshape(arg(self.name(), inputs, 0)?, &self.shape)
    }

    fn gradient(&self, out_grad: &Tensor, node: &Tensor) -> Result<Vec<Tensor>> {
        Ok(vec![out_grad.reshape(input(node, 0)?.shape()?)?])
    }
}

/// Broadcasts to a target shape.
#[derive(Debug, Clone, Default)]
pub struct BroadcastTo {
    /// Target shape.
    pub shape: Vec<usize>,
}

impl Operator for BroadcastTo {
    fn name(&self) -> &'static str {
        "broadcast_to"
    }

    fn arity(&self) -> usize {
        1
    }

    fn compute(&self, backend: &dyn Backend, inputs: &[&NdArray]) -> Result<NdArray> {
        backend.broadcast_to(arg(self.name(), inputs, 0)?, &self.shape)
    }

    fn gradient(&self, out_grad: &Tensor, node: &Tensor) -> Result<Vec<Tensor>> {
        Ok(vec![sum_to_shape(out_grad, input(node, 0)?.shape()?)?])
    }
}

/// Sum over some axes, or all of them.
#[derive(Debug, Clone, Default)]
pub struct Summation {
    /// Axes to reduce; `None` reduces everything to a scalar.
    pub axes: Option<Vec<usize>>,
}

impl Operator for Summation {
    fn name(&self) -> &'static str {
        "summation"
    }

    fn arity(&self) -> usize {
        1
    }

    fn compute(&self, backend: &dyn Backend, inputs: &[&NdArray]) -> Result<NdArray> {
        backend.sum(arg(self.name(), inputs, 0)?, self.axes.as_deref())
    }

    fn gradient(&self, out_grad: &Tensor, node: &Tensor) -> Result<Vec<Tensor>> {
        let shape = input(node, 0)?.shape()?;
        let kept: Vec<usize> = match &self.axes {
            None => vec![1; shape.len()],
            Some(axes) => shape
                .iter()
                .enumerate()
                .map(|(i, &d)| if axes.contains(&i) { 1 } else { d })
                .collect(),
        };
        Ok(vec![out_grad.reshape(&kept)?.broadcast_to(shape)?])
    }
}
