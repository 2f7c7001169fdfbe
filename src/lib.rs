//! # `briny_grad`
//!
//! A minimal reverse-mode automatic differentiation engine.
//!
//! Programs build a directed acyclic graph of tensor operations, evaluate it
//! forward, and propagate gradients backward along the same edges with the
//! chain rule. Gradients of values used in several places are summed.
//!
//! ## Features
//!
//! - **Tensors**: shared graph nodes holding a cached `f64` array, created
//!   from an explicit [`Context`]
//! - **Operators**: element-wise arithmetic with broadcasting, `log`, `exp`,
//!   `relu`, transpose, reshape, broadcast, summation and batched matmul,
//!   each with its gradient rule
//! - **Autograd**: iterative reverse-topological backward pass with an
//!   explicit policy for repeated passes
//! - **Backends**: the array [`Backend`] is injected; [`CpuBackend`] runs
//!   large kernels on Rayon
//! - **Training helpers**: softmax and MSE losses, one-hot encoding, SGD
//!
//! ## Example
//!
//! ```rust
//! use briny_grad::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let ctx = Context::cpu();
//! let w = ctx.parameter(array!([[1.0, 2.0], [3.0, 4.0]]));
//! let x = ctx.constant(array!([[1.0], [1.0]]));
//! let loss = w.matmul(&x)?.relu()?.sum(None)?;
//! loss.backward()?;
//! assert_eq!(w.grad().unwrap().to_array()?, array!([[1.0, 1.0], [1.0, 1.0]]));
//! # Ok(())
//! # }
//! ```
//!
//! [`Context`]: graph::Context
//! [`Backend`]: backend::Backend
//! [`CpuBackend`]: backend::CpuBackend

#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::many_single_char_names,
    clippy::cast_possible_truncation,
    clippy::similar_names,
    clippy::cast_precision_loss,
    clippy::module_name_repetitions,
    clippy::unnecessary_cast
)]
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod approx;
pub mod array;
pub mod backend;
pub mod backprop;
pub mod error;
pub mod graph;
pub mod nn;
pub mod ops;
pub mod tensor;

pub use array::NdArray;
pub use error::{AutogradError, Result};
pub use tensor::Tensor;

/// Everything needed to build and train a graph.
pub mod prelude {
    pub use crate::approx::{ApproxEquality, RelativeEq};
    pub use crate::array;
    pub use crate::array::{DType, NdArray};
    pub use crate::backend::{Backend, CpuBackend};
    pub use crate::backprop::GradMode;
    pub use crate::error::{AutogradError, Result};
    pub use crate::graph::{Context, EvalMode};
    pub use crate::nn;
    pub use crate::tensor::Tensor;
}
