//! Graph construction context and traversal.
//!
//! A [`Context`] is the explicit replacement for module-level configuration:
//! it carries the array [`Backend`] every node computes with and the
//! [`EvalMode`] deciding when nodes are computed. Leaves are created from a
//! context and derived nodes inherit the context of their first input.
//!
//! # Example
//!
//! ```rust
//! use briny_grad::array;
//! use briny_grad::graph::{Context, EvalMode};
//!
//! let ctx = Context::builder().mode(EvalMode::Lazy).build();
//! let x = ctx.parameter(array!([1.0, 2.0]));
//! let y = x.mul_scalar(3.0).unwrap();
//! assert!(!y.is_realized());
//! assert_eq!(y.realize().unwrap().data(), &[3.0, 6.0]);
//! ```

use crate::array::NdArray;
use crate::backend::{Backend, CpuBackend};
use crate::tensor::Tensor;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// When derived nodes compute their value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvalMode {
    /// Compute each node as soon as it is built; shape errors surface at construction.
    #[default]
    Eager,
    /// Defer computation until [`Tensor::realize`] (or anything that needs the value).
    Lazy,
}

/// Backend handle and evaluation policy shared by every node of a graph.
#[derive(Debug)]
pub struct Context {
    backend: Arc<dyn Backend>,
    mode: EvalMode,
}

impl Context {
    /// A context over `backend` with the given mode.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, mode: EvalMode) -> Arc<Self> {
        debug!(backend = backend.name(), ?mode, "creating graph context");
        Arc::new(Self { backend, mode })
    }

    /// The default eager context on a [`CpuBackend`].
    #[must_use]
    pub fn cpu() -> Arc<Self> {
        Self::builder().build()
    }

    /// Starts configuring a context.
    #[must_use]
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// The injected array backend.
    #[must_use]
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// The evaluation mode.
    #[must_use]
    pub const fn mode(&self) -> EvalMode {
        self.mode
    }

    /// Wraps `array` as a leaf node.
    #[must_use]
    pub fn leaf(self: &Arc<Self>, array: NdArray, requires_grad: bool) -> Tensor {
        Tensor::leaf(self, array, requires_grad)
    }

    /// A leaf that accumulates gradients (a trainable parameter).
    #[must_use]
    pub fn parameter(self: &Arc<Self>, array: NdArray) -> Tensor {
        self.leaf(array, true)
    }

    /// A leaf that never receives gradients.
    #[must_use]
    pub fn constant(self: &Arc<Self>, array: NdArray) -> Tensor {
        self.leaf(array, false)
    }
}

/// Builder for [`Context`].
#[derive(Debug, Default)]
pub struct ContextBuilder {
    backend: Option<Arc<dyn Backend>>,
    mode: EvalMode,
}

impl ContextBuilder {
    /// Uses `backend` for every node built from the context.
    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Uses a configured [`CpuBackend`].
    #[must_use]
    pub fn cpu(self, cpu: CpuBackend) -> Self {
        self.backend(Arc::new(cpu))
    }

    /// Sets the evaluation mode.
    #[must_use]
    pub const fn mode(mut self, mode: EvalMode) -> Self {
        self.mode = mode;
        self
    }

    /// Finishes the context; the backend defaults to [`CpuBackend::new`].
    #[must_use]
    pub fn build(self) -> Arc<Context> {
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(CpuBackend::new()));
        Context::new(backend, self.mode)
    }
}

/// Nodes reachable from `root` through `inputs`, each after all of its inputs.
///
/// Only nodes accepted by `include` are visited; a rejected node's inputs
/// are not explored through it. The traversal is an iterative depth-first
/// post-order, so graph depth is not limited by the call stack.
pub(crate) fn post_order(root: &Tensor, include: impl Fn(&Tensor) -> bool) -> Vec<Tensor> {
    let mut order = Vec::new();
    if !include(root) {
        return order;
    }

    let mut visited = HashSet::new();
    let mut stack = vec![(root.clone(), false)];
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        if !visited.insert(node.id()) {
            continue;
        }
        stack.push((node.clone(), true));
        for input in node.inputs().iter().rev() {
            if !visited.contains(&input.id()) && include(input) {
                stack.push((input.clone(), false));
            }
        }
    }
    order
}

/// Nodes reachable from `root` with every node before all of its inputs.
///
/// This is the order the backward pass consumes: a node is only reached once
/// every node that uses it has been processed.
pub(crate) fn reverse_topological_order(
    root: &Tensor,
    include: impl Fn(&Tensor) -> bool,
) -> Vec<Tensor> {
    let mut order = post_order(root, include);
    order.reverse();
    order
}
