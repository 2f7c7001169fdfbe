//! Graph nodes and the user-facing [`Tensor`] handle.
//!
//! A [`Tensor`] is a cheap, clonable handle to one node of the computation
//! graph. A node either wraps a user-supplied array (a leaf) or records the
//! [`Operator`] and input nodes that produce its value. Many downstream nodes
//! may hold the same input, so nodes are shared through `Arc` and live as long
//! as their longest holder.
//!
//! ## Lifecycle
//!
//! 1. **Leaves** are created from a [`Context`] and hold their value from the start.
//! 2. **Operator methods** (`add`, `matmul`, `relu`, ...) build a new node and
//!    never touch their operands. In [`EvalMode::Eager`] the node is computed
//!    immediately; in [`EvalMode::Lazy`] it waits for [`Tensor::realize`].
//! 3. **Realization** computes the missing part of the upstream graph once;
//!    every node caches its value and never recomputes or mutates it.
//! 4. **Backward** attaches a gradient node to every node that requires one,
//!    see [`crate::backprop`].
//!
//! Operator overloading is available on `&Tensor` and `Tensor`; since any
//! operation may fail on incompatible shapes, every overload yields a
//! [`Result`]:
//!
//! ```rust
//! use briny_grad::{array, graph::Context};
//!
//! # fn main() -> briny_grad::error::Result<()> {
//! let ctx = Context::cpu();
//! let a = ctx.parameter(array!([1.0, 2.0]));
//! let b = ctx.parameter(array!([3.0, 4.0]));
//! let c = ((&a * &b)? + 1.0)?;
//! assert_eq!(c.realize()?.data(), &[4.0, 9.0]);
//! # Ok(())
//! # }
//! ```

use crate::array::{DType, NdArray};
use crate::backend::Backend;
use crate::backprop::{self, GradMode};
use crate::error::{AutogradError, Result};
use crate::graph::{self, Context, EvalMode};
use crate::ops::{
    AddScalar, BroadcastTo, DivScalar, EWiseAdd, EWiseDiv, EWiseMul, Exp, Log, MatMul, MulScalar,
    Negate, Operator, PowerScalar, ReLU, Reshape, Summation, Transpose,
};
use core::fmt;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::trace;

static NEXT_NODE_ID: AtomicUsize = AtomicUsize::new(0);

fn next_id() -> usize {
    NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)
}

/// One vertex of the computation graph.
struct Node {
    id: usize,
    ctx: Arc<Context>,
    op: Option<Box<dyn Operator>>,
    inputs: Vec<Tensor>,
    requires_grad: bool,
    cached: OnceLock<NdArray>,
    // held while the value is being computed
    compute: Mutex<()>,
    grad: RwLock<Option<Tensor>>,
}

impl Drop for Node {
    // unlinks uniquely owned ancestors one by one so that dropping a long
    // chain does not recurse once per node
    fn drop(&mut self) {
        let mut stack = std::mem::take(&mut self.inputs);
        while let Some(Tensor(node)) = stack.pop() {
            if let Some(mut node) = Arc::into_inner(node) {
                stack.append(&mut node.inputs);
            }
        }
    }
}

/// Shared handle to a graph node.
#[derive(Clone)]
pub struct Tensor(Arc<Node>);

#[allow(clippy::should_implement_trait)]
impl Tensor {
    /// Wraps `array` as a leaf of `ctx`'s graph.
    #[must_use]
    pub fn leaf(ctx: &Arc<Context>, array: NdArray, requires_grad: bool) -> Self {
        let cached = OnceLock::new();
        let _ = cached.set(array);
        Self(Arc::new(Node {
            id: next_id(),
            ctx: Arc::clone(ctx),
            op: None,
            inputs: Vec::new(),
            requires_grad,
            cached,
            compute: Mutex::new(()),
            grad: RwLock::new(None),
        }))
    }

    /// Builds the node `op(inputs...)` in the context of the first input.
    ///
    /// The new node requires grad if any input does. In eager mode it is
    /// realized before being returned. This is also the entry point for
    /// operators defined outside this crate.
    ///
    /// # Errors
    ///
    /// - [`AutogradError::UnrealizedValue`] if `inputs` is empty
    /// - any error of `op.compute` in eager mode
    pub fn from_op(op: Box<dyn Operator>, inputs: Vec<Self>) -> Result<Self> {
        let Some(first) = inputs.first() else {
            return Err(AutogradError::UnrealizedValue {
                id: NEXT_NODE_ID.load(Ordering::Relaxed),
                reason: format!("operator `{}` was applied to no inputs", op.name()),
            });
        };
        let ctx = Arc::clone(&first.0.ctx);
        let requires_grad = inputs.iter().any(Self::requires_grad);
        let node = Self(Arc::new(Node {
            id: next_id(),
            ctx,
            op: Some(op),
            inputs,
            requires_grad,
            cached: OnceLock::new(),
            compute: Mutex::new(()),
            grad: RwLock::new(None),
        }));
        if node.0.ctx.mode() == EvalMode::Eager {
            node.realize()?;
        }
        Ok(node)
    }

    fn unary(&self, op: impl Operator + 'static) -> Result<Self> {
        Self::from_op(Box::new(op), vec![self.clone()])
    }

    fn binary(&self, op: impl Operator + 'static, rhs: &Self) -> Result<Self> {
        Self::from_op(Box::new(op), vec![self.clone(), rhs.clone()])
    }

    /// Unique identity of the node.
    #[must_use]
    pub fn id(&self) -> usize {
        self.0.id
    }

    /// Whether the node was supplied directly rather than computed by an operator.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.0.op.is_none()
    }

    /// Whether backward passes compute a gradient for this node.
    #[must_use]
    pub fn requires_grad(&self) -> bool {
        self.0.requires_grad
    }

    /// Operand nodes in order (empty for leaves).
    #[must_use]
    pub fn inputs(&self) -> &[Self] {
        &self.0.inputs
    }

    /// The operator that produced this node, if any.
    #[must_use]
    pub fn op(&self) -> Option<&dyn Operator> {
        self.0.op.as_deref()
    }

    /// The context the node was built in.
    #[must_use]
    pub fn context(&self) -> &Arc<Context> {
        &self.0.ctx
    }

    /// The array backend the node computes with.
    #[must_use]
    pub fn backend(&self) -> &dyn Backend {
        self.0.ctx.backend()
    }

    /// Whether the value has been computed.
    #[must_use]
    pub fn is_realized(&self) -> bool {
        self.0.cached.get().is_some()
    }

    /// The node's value, computing it and any unrealized upstream node first.
    ///
    /// Every node is computed at most once, even when several threads
    /// realize it at the same time, and keeps its value for the rest of its
    /// life.
    ///
    /// # Errors
    ///
    /// Any shape error raised by an upstream operator.
    pub fn realize(&self) -> Result<&NdArray> {
        if let Some(value) = self.0.cached.get() {
            return Ok(value);
        }
        for node in graph::post_order(self, |t| !t.is_realized()) {
            node.compute_cached()?;
        }
        self.0.cached.get().ok_or_else(|| AutogradError::UnrealizedValue {
            id: self.id(),
            reason: "realization finished without a value".to_owned(),
        })
    }

    /// Computes this node from its already realized inputs.
    ///
    /// Threads racing on the same node serialize on its compute lock; the
    /// losers find the value published and return.
    fn compute_cached(&self) -> Result<()> {
        if self.is_realized() {
            return Ok(());
        }
        let _guard = self.0.compute.lock();
        if self.is_realized() {
            return Ok(());
        }
        let op = self.op().ok_or_else(|| AutogradError::UnrealizedValue {
            id: self.id(),
            reason: "leaf without a value".to_owned(),
        })?;
        if op.arity() != self.inputs().len() {
            return Err(AutogradError::UnrealizedValue {
                id: self.id(),
                reason: format!(
                    "operator `{}` takes {} inputs, got {}",
                    op.name(),
                    op.arity(),
                    self.inputs().len()
                ),
            });
        }

        let args = self
            .inputs()
            .iter()
            .map(|input| {
                input.0.cached.get().ok_or_else(|| AutogradError::UnrealizedValue {
                    id: input.id(),
                    reason: "input was not realized before its consumer".to_owned(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let value = op.compute(self.backend(), &args)?;
        trace!(id = self.id(), op = op.name(), shape = ?value.shape(), "realized node");
        let _ = self.0.cached.set(value);
        Ok(())
    }

    /// A copy of the realized value.
    ///
    /// # Errors
    ///
    /// See [`Tensor::realize`].
    pub fn to_array(&self) -> Result<NdArray> {
        self.realize().cloned()
    }

    /// Dimensions of the value.
    ///
    /// # Errors
    ///
    /// See [`Tensor::realize`].
    pub fn shape(&self) -> Result<&[usize]> {
        Ok(self.realize()?.shape())
    }

    /// Element type of the value.
    ///
    /// # Errors
    ///
    /// See [`Tensor::realize`].
    pub fn dtype(&self) -> Result<DType> {
        Ok(self.realize()?.dtype())
    }

    /// The single element of a one-element tensor.
    ///
    /// # Errors
    ///
    /// Realization errors, or [`AutogradError::ShapeMismatch`] for larger tensors.
    pub fn item(&self) -> Result<f64> {
        self.realize()?.item()
    }

    /// The gradient attached by the last backward pass that reached this node.
    #[must_use]
    pub fn grad(&self) -> Option<Self> {
        self.0.grad.read().clone()
    }

    pub(crate) fn set_grad(&self, grad: Self) {
        *self.0.grad.write() = Some(grad);
    }

    /// Clears the gradient.
    pub fn zero_grad(&self) {
        *self.0.grad.write() = None;
    }

    /// A provenance-free constant leaf with this node's value.
    ///
    /// # Errors
    ///
    /// See [`Tensor::realize`].
    pub fn detach(&self) -> Result<Self> {
        Ok(Self::leaf(&self.0.ctx, self.to_array()?, false))
    }

    /// Backpropagates from this node, seeding with ones of its shape.
    ///
    /// Gradients of visited nodes are replaced, not added to.
    ///
    /// # Errors
    ///
    /// Realization or gradient-rule errors.
    pub fn backward(&self) -> Result<()> {
        backprop::backward(self, None, GradMode::Overwrite).map(drop)
    }

    /// Backpropagates from this node with an explicit seed gradient.
    ///
    /// # Errors
    ///
    /// [`AutogradError::ShapeMismatch`] if `seed` does not have this node's
    /// shape, plus any realization or gradient-rule error.
    pub fn backward_with(&self, seed: &Self) -> Result<()> {
        backprop::backward(self, Some(seed), GradMode::Overwrite).map(drop)
    }

    /// Backpropagates from this node, adding to gradients already attached.
    ///
    /// # Errors
    ///
    /// Realization or gradient-rule errors.
    pub fn backward_accumulate(&self) -> Result<()> {
        backprop::backward(self, None, GradMode::Accumulate).map(drop)
    }

    /// Element-wise `self + rhs` with broadcasting.
    ///
    /// # Errors
    ///
    /// [`AutogradError::ShapeMismatch`] if the shapes do not broadcast.
    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.binary(EWiseAdd, rhs)
    }

    /// Element-wise `self + scalar`.
    ///
    /// # Errors
    ///
    /// Upstream realization errors in eager mode.
    pub fn add_scalar(&self, scalar: f64) -> Result<Self> {
        self.unary(AddScalar { scalar })
    }

    /// Element-wise `self - rhs`, built as `self + (-rhs)`.
    ///
    /// # Errors
    ///
    /// [`AutogradError::ShapeMismatch`] if the shapes do not broadcast.
    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.add(&rhs.neg()?)
    }

    /// Element-wise `self - scalar`.
    ///
    /// # Errors
    ///
    /// Upstream realization errors in eager mode.
    pub fn sub_scalar(&self, scalar: f64) -> Result<Self> {
        self.add_scalar(-scalar)
    }

    /// Element-wise `self * rhs` with broadcasting.
    ///
    /// # Errors
    ///
    /// [`AutogradError::ShapeMismatch`] if the shapes do not broadcast.
    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.binary(EWiseMul, rhs)
    }

    /// Element-wise `self * scalar`.
    ///
    /// # Errors
    ///
    /// Upstream realization errors in eager mode.
    pub fn mul_scalar(&self, scalar: f64) -> Result<Self> {
        self.unary(MulScalar { scalar })
    }

    /// Element-wise `self / rhs` with broadcasting.
    ///
    /// # Errors
    ///
    /// [`AutogradError::ShapeMismatch`] if the shapes do not broadcast.
    pub fn div(&self, rhs: &Self) -> Result<Self> {
        self.binary(EWiseDiv, rhs)
    }

    /// Element-wise `self / scalar`.
    ///
    /// # Errors
    ///
    /// Upstream realization errors in eager mode.
    pub fn div_scalar(&self, scalar: f64) -> Result<Self> {
        self.unary(DivScalar { scalar })
    }

    /// Element-wise `self ^ exponent`.
    ///
    /// # Errors
    ///
    /// Upstream realization errors in eager mode.
    pub fn powi(&self, exponent: i32) -> Result<Self> {
        self.unary(PowerScalar { exponent })
    }

    /// Matrix product over the last two axes with broadcast batch axes.
    ///
    /// # Errors
    ///
    /// [`AutogradError::ShapeMismatch`] for incompatible operands.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        self.binary(MatMul, rhs)
    }

    /// Element-wise negation.
    ///
    /// # Errors
    ///
    /// Upstream realization errors in eager mode.
    pub fn neg(&self) -> Result<Self> {
        self.unary(Negate)
    }

    /// Swaps two axes, the last two when `axes` is `None`.
    ///
    /// # Errors
    ///
    /// [`AutogradError::ShapeMismatch`] for an out-of-range axis or a rank
    /// below 2 with default axes.
    pub fn transpose(&self, axes: Option<(usize, usize)>) -> Result<Self> {
        self.unary(Transpose { axes })
    }

    /// Same elements under a new shape.
    ///
    /// # Errors
    ///
    /// [`AutogradError::ShapeMismatch`] if the element count changes.
    pub fn reshape(&self, shape: &[usize]) -> Result<Self> {
        self.unary(Reshape {
            shape: shape.to_vec(),
        })
    }

    /// Broadcasts to `shape` under NumPy rules.
    ///
    /// # Errors
    ///
    /// [`AutogradError::ShapeMismatch`] if the value is not broadcastable to `shape`.
    pub fn broadcast_to(&self, shape: &[usize]) -> Result<Self> {
        self.unary(BroadcastTo {
            shape: shape.to_vec(),
        })
    }

    /// Sums over `axes`, or over everything when `None`.
    ///
    /// # Errors
    ///
    /// [`AutogradError::ShapeMismatch`] for an out-of-range or repeated axis.
    pub fn sum(&self, axes: Option<&[usize]>) -> Result<Self> {
        self.unary(Summation {
            axes: axes.map(<[usize]>::to_vec),
        })
    }

    /// Element-wise natural logarithm.
    ///
    /// # Errors
    ///
    /// Upstream realization errors in eager mode.
    pub fn log(&self) -> Result<Self> {
        self.unary(Log)
    }

    /// Element-wise exponential.
    ///
    /// # Errors
    ///
    /// Upstream realization errors in eager mode.
    pub fn exp(&self) -> Result<Self> {
        self.unary(Exp)
    }

    /// Element-wise `max(x, 0)`.
    ///
    /// # Errors
    ///
    /// Upstream realization errors in eager mode.
    pub fn relu(&self) -> Result<Self> {
        self.unary(ReLU)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.id())
            .field("op", &self.op().map_or("leaf", |op| op.name()))
            .field("inputs", &self.inputs().iter().map(Self::id).collect::<Vec<_>>())
            .field("requires_grad", &self.requires_grad())
            .field("value", &self.0.cached.get())
            .finish()
    }
}

macro_rules! impl_binary_overload {
    ($trait:ident, $method:ident, $tensor_fn:ident, $scalar_fn:ident) => {
        impl core::ops::$trait<&Tensor> for &Tensor {
            type Output = Result<Tensor>;

            fn $method(self, rhs: &Tensor) -> Self::Output {
                Tensor::$tensor_fn(self, rhs)
            }
        }

        impl core::ops::$trait<Tensor> for Tensor {
            type Output = Result<Tensor>;

            fn $method(self, rhs: Tensor) -> Self::Output {
                Tensor::$tensor_fn(&self, &rhs)
            }
        }

        impl core::ops::$trait<&Tensor> for Tensor {
            type Output = Result<Tensor>;

            fn $method(self, rhs: &Tensor) -> Self::Output {
                Tensor::$tensor_fn(&self, rhs)
            }
        }

        impl core::ops::$trait<f64> for &Tensor {
            type Output = Result<Tensor>;

            fn $method(self, rhs: f64) -> Self::Output {
                Tensor::$scalar_fn(self, rhs)
            }
        }

        impl core::ops::$trait<f64> for Tensor {
            type Output = Result<Tensor>;

            fn $method(self, rhs: f64) -> Self::Output {
                Tensor::$scalar_fn(&self, rhs)
            }
        }
    };
}

impl_binary_overload!(Add, add, add, add_scalar);
impl_binary_overload!(Sub, sub, sub, sub_scalar);
impl_binary_overload!(Mul, mul, mul, mul_scalar);
impl_binary_overload!(Div, div, div, div_scalar);

impl core::ops::Neg for &Tensor {
    type Output = Result<Tensor>;

    fn neg(self) -> Self::Output {
        Tensor::neg(self)
    }
}

impl core::ops::Neg for Tensor {
    type Output = Result<Tensor>;

    fn neg(self) -> Self::Output {
        Tensor::neg(&self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array;

    #[test]
    fn leaves_carry_their_value() {
        let ctx = Context::cpu();
        let x = ctx.constant(array!([[1.0, 2.0]]));
        assert!(x.is_leaf());
        assert!(x.is_realized());
        assert!(!x.requires_grad());
        assert_eq!(x.shape().unwrap(), &[1, 2]);
        assert_eq!(x.dtype().unwrap(), DType::Float64);
        assert!(x.grad().is_none());
    }

    #[test]
    fn requires_grad_propagates_from_any_input() {
        let ctx = Context::cpu();
        let c = ctx.constant(array!([1.0]));
        let p = ctx.parameter(array!([2.0]));
        assert!(!c.exp().unwrap().requires_grad());
        assert!(c.add(&p).unwrap().requires_grad());
    }

    #[test]
    fn eager_mode_reports_shape_errors_at_construction() {
        let ctx = Context::cpu();
        let a = ctx.parameter(NdArray::ones(&[2, 3]));
        let b = ctx.parameter(NdArray::ones(&[4, 2]));
        assert!(a.matmul(&b).unwrap_err().is_shape_mismatch());
    }

    #[test]
    fn lazy_mode_defers_until_realize() {
        let ctx = Context::builder().mode(EvalMode::Lazy).build();
        let a = ctx.parameter(NdArray::ones(&[2, 3]));
        let b = ctx.parameter(NdArray::ones(&[4, 2]));
        let bad = a.matmul(&b).unwrap();
        assert!(!bad.is_realized());
        assert!(bad.realize().unwrap_err().is_shape_mismatch());

        let good = a.sum(None).unwrap().mul_scalar(2.0).unwrap();
        assert!(!good.is_realized());
        assert_eq!(good.item().unwrap(), 12.0);
        assert!(good.inputs()[0].is_realized());
    }

    #[test]
    fn overloads_build_the_same_nodes_as_methods() {
        let ctx = Context::cpu();
        let a = ctx.parameter(array!([4.0, 9.0]));
        let b = ctx.parameter(array!([2.0, 3.0]));
        assert_eq!((&a - &b).unwrap().to_array().unwrap(), array!([2.0, 6.0]));
        assert_eq!((&a / &b).unwrap().to_array().unwrap(), array!([2.0, 3.0]));
        assert_eq!((&a / 2.0).unwrap().to_array().unwrap(), array!([2.0, 4.5]));
        assert_eq!((-&a).unwrap().to_array().unwrap(), array!([-4.0, -9.0]));
        let chained = ((a.clone() * b.clone()).unwrap() - 1.0).unwrap();
        assert_eq!(chained.op().unwrap().name(), "add_scalar");
        assert_eq!(chained.to_array().unwrap(), array!([7.0, 26.0]));
    }

    #[test]
    fn operator_without_inputs_is_rejected() {
        let err = Tensor::from_op(Box::new(Negate), Vec::new()).unwrap_err();
        assert!(matches!(err, AutogradError::UnrealizedValue { .. }));
    }

    #[test]
    fn detach_drops_provenance() {
        let ctx = Context::cpu();
        let a = ctx.parameter(array!([1.0, -1.0]));
        let r = a.relu().unwrap();
        let d = r.detach().unwrap();
        assert!(d.is_leaf());
        assert!(!d.requires_grad());
        assert_eq!(d.to_array().unwrap(), array!([1.0, 0.0]));
    }

    #[test]
    fn backward_does_not_keep_the_graph_alive() {
        let ctx = Context::cpu();
        let x = ctx.parameter(array!([0.5, 1.5]));
        let weak = Arc::downgrade(&x.0);
        let y = x.exp().unwrap().mul(&x).unwrap().sum(None).unwrap();
        y.backward().unwrap();
        y.backward_accumulate().unwrap();
        assert!(x.grad().is_some());
        drop(y);
        drop(x);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn replaced_parameters_are_freed() {
        let ctx = Context::cpu();
        let mut w = ctx.parameter(array!([[1.0, -2.0], [0.5, 3.0]]));
        let first = Arc::downgrade(&w.0);
        for _ in 0..3 {
            let loss = w.mul(&w).unwrap().sum(None).unwrap();
            loss.backward().unwrap();
            w = crate::nn::sgd_step(&w, 0.1).unwrap();
        }
        assert!(first.upgrade().is_none());
    }

    #[test]
    fn tensors_are_thread_safe_handles() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Tensor>();
    }
}
