//! Element-wise operators.
//!
//! Binary operators broadcast their operands in the forward pass; their
//! gradients are reduced back to each operand's shape with
//! [`sum_to_shape`].

use super::{Operator, arg, input, sum_to_shape};
use crate::array::NdArray;
use crate::backend::{Backend, BinaryOp, ScalarOp, UnaryOp};
use crate::error::Result;
use crate::tensor::Tensor;

/// Both operands of a binary node.
fn operands(node: &Tensor) -> Result<(&Tensor, &Tensor)> {
    Ok((input(node, 0)?, input(node, 1)?))
}

/// `lhs + rhs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EWiseAdd;

impl Operator for EWiseAdd {
    fn name(&self) -> &'static str {
        "add"
    }

    fn arity(&self) -> usize {
        2
    }

    fn compute(&self, backend: &dyn Backend, inputs: &[&NdArray]) -> Result<NdArray> {
        backend.binary(
            BinaryOp::Add,
            arg(self.name(), inputs, 0)?,
            arg(self.name(), inputs, 1)?,
        )
    }

    fn gradient(&self, out_grad: &Tensor, node: &Tensor) -> Result<Vec<Tensor>> {
        let (lhs, rhs) = operands(node)?;
        Ok(vec![
            sum_to_shape(out_grad, lhs.shape()?)?,
            sum_to_shape(out_grad, rhs.shape()?)?,
        ])
    }
}

/// `x + scalar`.
#[derive(Debug, Clone, Copy)]
pub struct AddScalar {
    /// Added to every element.
    pub scalar: f64,
}

impl Operator for AddScalar {
    fn name(&self) -> &'static str {
        "add_scalar"
    }

    fn arity(&self) -> usize {
        1
    }

    fn compute(&self, backend: &dyn Backend, inputs: &[&NdArray]) -> Result<NdArray> {
        Ok(backend.scalar(ScalarOp::Add, arg(self.name(), inputs, 0)?, self.scalar))
    }

    fn gradient(&self, out_grad: &Tensor, _node: &Tensor) -> Result<Vec<Tensor>> {
        Ok(vec![out_grad.clone()])
    }
}

/// `lhs * rhs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EWiseMul;

impl Operator for EWiseMul {
    fn name(&self) -> &'static str {
        "multiply"
    }

    fn arity(&self) -> usize {
        2
    }

    fn compute(&self, backend: &dyn Backend, inputs: &[&NdArray]) -> Result<NdArray> {
        backend.binary(
            BinaryOp::Mul,
            arg(self.name(), inputs, 0)?,
            arg(self.name(), inputs, 1)?,
        )
    }

    fn gradient(&self, out_grad: &Tensor, node: &Tensor) -> Result<Vec<Tensor>> {
        let (lhs, rhs) = operands(node)?;
        Ok(vec![
            sum_to_shape(&out_grad.mul(rhs)?, lhs.shape()?)?,
            sum_to_shape(&out_grad.mul(lhs)?, rhs.shape()?)?,
        ])
    }
}

/// `x * scalar`.
#[derive(Debug, Clone, Copy)]
pub struct MulScalar {
    /// Multiplies every element.
    pub scalar: f64,
}

impl Operator for MulScalar {
    fn name(&self) -> &'static str {
        "mul_scalar"
    }

    fn arity(&self) -> usize {
        1
    }

    fn compute(&self, backend: &dyn Backend, inputs: &[&NdArray]) -> Result<NdArray> {
        Ok(backend.scalar(ScalarOp::Mul, arg(self.name(), inputs, 0)?, self.scalar))
    }

    fn gradient(&self, out_grad: &Tensor, _node: &Tensor) -> Result<Vec<Tensor>> {
        Ok(vec![out_grad.mul_scalar(self.scalar)?])
    }
}

/// `x ^ exponent` for an integer exponent.
#[derive(Debug, Clone, Copy)]
pub struct PowerScalar {
    /// The integer power.
    pub exponent: i32,
}

impl Operator for PowerScalar {
    fn name(&self) -> &'static str {
        "power_scalar"
    }

    fn arity(&self) -> usize {
        1
    }

    fn compute(&self, backend: &dyn Backend, inputs: &[&NdArray]) -> Result<NdArray> {
        Ok(backend.powi(arg(self.name(), inputs, 0)?, self.exponent))
    }

    fn gradient(&self, out_grad: &Tensor, node: &Tensor) -> Result<Vec<Tensor>> {
        // x^0 is constant; skipping x^-1 keeps x = 0 from producing 0 * inf
        if self.exponent == 0 {
            return Ok(vec![out_grad.mul_scalar(0.0)?]);
        }
        let x = input(node, 0)?;
        let slope = x
            .powi(self.exponent - 1)?
            .mul_scalar(f64::from(self.exponent))?;
        Ok(vec![out_grad.mul(&slope)?])
    }
}

/// `lhs / rhs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EWiseDiv;

impl Operator for EWiseDiv {
    fn name(&self) -> &'static str {
        "divide"
    }

    fn arity(&self) -> usize {
        2
    }

    fn compute(&self, backend: &dyn Backend, inputs: &[&NdArray]) -> Result<NdArray> {
        backend.binary(
            BinaryOp::Div,
            arg(self.name(), inputs, 0)?,
            arg(self.name(), inputs, 1)?,
        )
    }

    fn gradient(&self, out_grad: &Tensor, node: &Tensor) -> Result<Vec<Tensor>> {
        let (lhs, rhs) = operands(node)?;
        let d_lhs = out_grad.div(rhs)?;
        let d_rhs = out_grad.neg()?.mul(lhs)?.mul(&rhs.powi(-2)?)?;
        Ok(vec![
            sum_to_shape(&d_lhs, lhs.shape()?)?,
            sum_to_shape(&d_rhs, rhs.shape()?)?,
        ])
    }
}

/// `x / scalar`.
#[derive(Debug, Clone, Copy)]
pub struct DivScalar {
    /// Divides every element.
    pub scalar: f64,
}

impl Operator for DivScalar {
    fn name(&self) -> &'static str {
        "div_scalar"
    }

    fn arity(&self) -> usize {
        1
    }

    fn compute(&self, backend: &dyn Backend, inputs: &[&NdArray]) -> Result<NdArray> {
        Ok(backend.scalar(ScalarOp::Div, arg(self.name(), inputs, 0)?, self.scalar))
    }

    fn gradient(&self, out_grad: &Tensor, _node: &Tensor) -> Result<Vec<Tensor>> {
        Ok(vec![out_grad.div_scalar(self.scalar)?])
    }
}

/// `-x`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Negate;

impl Operator for Negate {
    fn name(&self) -> &'static str {
        "negate"
    }

    fn arity(&self) -> usize {
        1
    }

    fn compute(&self, backend: &dyn Backend, inputs: &[&NdArray]) -> Result<NdArray> {
        Ok(backend.unary(UnaryOp::Neg, arg(self.name(), inputs, 0)?))
    }

    fn gradient(&self, out_grad: &Tensor, _node: &Tensor) -> Result<Vec<Tensor>> {
        Ok(vec![out_grad.neg()?])
    }
}

/// Natural logarithm.
///
/// Non-positive inputs follow IEEE-754 (`ln 0 = -inf`, `ln x = NaN` for
/// `x < 0`), and so does the gradient `out_grad / x`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Log;

impl Operator for Log {
    fn name(&self) -> &'static str {
        "log"
    }

    fn arity(&self) -> usize {
        1
    }

    fn compute(&self, backend: &dyn Backend, inputs: &[&NdArray]) -> Result<NdArray> {
        Ok(backend.unary(UnaryOp::Log, arg(self.name(), inputs, 0)?))
    }

    fn gradient(&self, out_grad: &Tensor, node: &Tensor) -> Result<Vec<Tensor>> {
        Ok(vec![out_grad.div(input(node, 0)?)?])
    }
}

/// `e^x`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Exp;

impl Operator for Exp {
    fn name(&self) -> &'static str {
        "exp"
    }

    fn arity(&self) -> usize {
        1
    }

    fn compute(&self, backend: &dyn Backend, inputs: &[&NdArray]) -> Result<NdArray> {
        Ok(backend.unary(UnaryOp::Exp, arg(self.name(), inputs, 0)?))
    }

    fn gradient(&self, out_grad: &Tensor, node: &Tensor) -> Result<Vec<Tensor>> {
        // the node already holds exp(x)
        Ok(vec![out_grad.mul(node)?])
    }
}

/// `max(x, 0)`.
///
/// The gradient mask comes from the forward input and is 0 where `x <= 0`,
/// so the subgradient at exactly 0 is 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReLU;

impl Operator for ReLU {
    fn name(&self) -> &'static str {
        "relu"
    }

    fn arity(&self) -> usize {
        1
    }

    fn compute(&self, backend: &dyn Backend, inputs: &[&NdArray]) -> Result<NdArray> {
        Ok(backend.scalar(ScalarOp::Maximum, arg(self.name(), inputs, 0)?, 0.0))
    }

    fn gradient(&self, out_grad: &Tensor, node: &Tensor) -> Result<Vec<Tensor>> {
        let x = input(node, 0)?;
        let mask = node.backend().positive_mask(x.realize()?);
        let mask = Tensor::leaf(node.context(), mask, false);
        Ok(vec![out_grad.mul(&mask)?])
    }
}
