//! Matrix multiplication.

use super::{Operator, arg, input, sum_to_shape};
use crate::array::NdArray;
use crate::backend::Backend;
use crate::error::Result;
use crate::tensor::Tensor;

/// `lhs @ rhs` over the last two axes; leading axes are batch axes and
/// broadcast against each other.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatMul;

impl Operator for MatMul {
    fn name(&self) -> &'static str {
        "matmul"
    }

    fn arity(&self) -> usize {
        2
    }

    fn compute(&self, backend: &dyn Backend, inputs: &[&NdArray]) -> Result<NdArray> {
        backend.matmul(arg(self.name(), inputs, 0)?, arg(self.name(), inputs, 1)?)
    }

    fn gradient(&self, out_grad: &Tensor, node: &Tensor) -> Result<Vec<Tensor>> {
        let (lhs, rhs) = (input(node, 0)?, input(node, 1)?);
        let d_lhs = out_grad.matmul(&rhs.transpose(None)?)?;
        let d_rhs = lhs.transpose(None)?.matmul(out_grad)?;
        // batch axes a single operand was broadcast over are summed out
        Ok(vec![
            sum_to_shape(&d_lhs, lhs.shape()?)?,
            sum_to_shape(&d_rhs, rhs.shape()?)?,
        ])
    }
}
