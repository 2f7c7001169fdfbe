//! Reverse-mode gradient propagation.
//!
//! # Backward pass
//!
//! Starting from a root node and a seed gradient (ones of the root's shape
//! unless supplied), the engine walks the nodes that require a gradient in
//! reverse topological order. Each node is reached only after every consumer
//! of it has delivered its contribution; the contributions are summed, and
//! the node's [`Operator`] turns the sum into one contribution per input.
//!
//! Contributions are ordinary [`Tensor`]s built from operator methods while
//! the pass runs. What ends up in a node's `.grad` is a detached constant
//! leaf holding the value of that sum: it has no provenance, so it never
//! keeps the forward graph alive after the caller drops it.
//!
//! ## Repeated passes
//!
//! The policy for a node that already carries a gradient is explicit:
//!
//! - [`GradMode::Overwrite`] (what [`Tensor::backward`] uses) replaces it,
//!   so two identical passes leave identical gradients.
//! - [`GradMode::Accumulate`] adds the new gradient to it, for gradient
//!   accumulation across several roots or micro-batches. Only the gradient of
//!   the current pass flows on to a node's inputs.
//!
//! [`Operator`]: crate::ops::Operator

use crate::error::{AutogradError, Result};
use crate::graph;
use crate::tensor::Tensor;
use std::collections::HashMap;
use tracing::{debug, trace};

/// What happens to a gradient already attached to a visited node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GradMode {
    /// Replace it with the gradient of this pass.
    #[default]
    Overwrite,
    /// Add the gradient of this pass to it.
    Accumulate,
}

/// Propagates gradients from `root` to every upstream node requiring one.
///
/// `seed` is the gradient of the final objective with respect to `root`;
/// `None` means ones shaped like `root`. Returns how many nodes received a
/// gradient, which is 0 when `root` does not require one.
///
/// # Errors
///
/// - [`AutogradError::ShapeMismatch`] if `seed` is not shaped like `root`, or
///   an operator returns the wrong number of gradients or a gradient shaped
///   unlike its input
/// - [`AutogradError::NotImplemented`] for an operator without a gradient rule
/// - any realization error
///
/// # Example
///
/// ```rust
/// use briny_grad::array;
/// use briny_grad::backprop::{self, GradMode};
/// use briny_grad::graph::Context;
///
/// let ctx = Context::cpu();
/// let x = ctx.parameter(array!([1.0, 2.0, 3.0]));
/// let y = x.mul(&x).unwrap().sum(None).unwrap();
/// let visited = backprop::backward(&y, None, GradMode::Overwrite).unwrap();
/// assert_eq!(visited, 3);
/// assert_eq!(x.grad().unwrap().realize().unwrap().data(), &[2.0, 4.0, 6.0]);
/// ```
pub fn backward(root: &Tensor, seed: Option<&Tensor>, mode: GradMode) -> Result<usize> {
    if !root.requires_grad() {
        debug!(root = root.id(), "backward from a node without requires_grad; nothing to do");
        return Ok(0);
    }

    let root_shape = root.shape()?.to_vec();
    let seed = match seed {
        Some(seed) => {
            let seed_shape = seed.shape()?;
            if seed_shape != root_shape.as_slice() {
                return Err(AutogradError::shape(
                    "backward",
                    format!("seed of shape {seed_shape:?} for a root of shape {root_shape:?}"),
                ));
            }
            seed.clone()
        }
        None => Tensor::leaf(
            root.context(),
            root.backend().ones(&root_shape),
            false,
        ),
    };

    let order = graph::reverse_topological_order(root, Tensor::requires_grad);
    debug!(root = root.id(), nodes = order.len(), ?mode, "starting backward pass");

    let mut pending: HashMap<usize, Vec<Tensor>> = HashMap::new();
    pending.insert(root.id(), vec![seed]);

    let mut visited = 0;
    for node in &order {
        // every node in `order` is reachable from root through nodes that
        // require grad, so it has at least one contribution
        let Some(contributions) = pending.remove(&node.id()) else {
            continue;
        };
        let grad = sum_contributions(node.id(), contributions)?;
        // `.grad` never holds provenance
        let stored = match (mode, node.grad()) {
            (GradMode::Accumulate, Some(existing)) => existing.add(&grad)?.detach()?,
            _ => grad.detach()?,
        };
        node.set_grad(stored);
        visited += 1;

        let Some(op) = node.op() else {
            continue;
        };
        let input_grads = op.gradient(&grad, node)?;
        if input_grads.len() != node.inputs().len() {
            return Err(AutogradError::shape(
                op.name(),
                format!(
                    "gradient rule returned {} gradients for {} inputs",
                    input_grads.len(),
                    node.inputs().len()
                ),
            ));
        }
        trace!(id = node.id(), op = op.name(), "propagated gradient");

        for (input, input_grad) in node.inputs().iter().zip(input_grads) {
            if !input.requires_grad() {
                continue;
            }
            let (want, have) = (input.shape()?, input_grad.shape()?);
            if want != have {
                return Err(AutogradError::shape(
                    op.name(),
                    format!("gradient of shape {have:?} for an input of shape {want:?}"),
                ));
            }
            pending.entry(input.id()).or_default().push(input_grad);
        }
    }

    debug!(root = root.id(), visited, "backward pass finished");
    Ok(visited)
}

/// Sums the gradient contributions delivered to one node.
fn sum_contributions(id: usize, contributions: Vec<Tensor>) -> Result<Tensor> {
    let mut iter = contributions.into_iter();
    let first = iter.next().ok_or_else(|| AutogradError::UnrealizedValue {
        id,
        reason: "node reached without gradient contributions".to_owned(),
    })?;
    iter.try_fold(first, |acc, g| acc.add(&g))
}
