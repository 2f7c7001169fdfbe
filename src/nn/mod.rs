//! Training helpers built only from [`Tensor`] operations.
//!
//! These are consumers of the autograd core: everything here could live in
//! user code. They cover a classifier of the form `relu(X @ W1) @ W2`
//! trained with softmax cross-entropy and plain SGD.
//!
//! # Example
//!
//! ```rust
//! use briny_grad::{array, graph::Context, nn};
//!
//! # fn main() -> briny_grad::error::Result<()> {
//! let ctx = Context::cpu();
//! let logits = ctx.parameter(array!([[2.0, 0.5], [0.1, 1.0]]));
//! let y = nn::one_hot(&ctx, &[0, 1], 2)?;
//! let loss = nn::softmax_loss(&logits, &y)?;
//! loss.backward()?;
//! let logits = nn::sgd_step(&logits, 0.1)?;
//! assert!(nn::softmax_loss(&logits, &y)?.item()? < loss.item()?);
//! # Ok(())
//! # }
//! ```

use crate::array::NdArray;
use crate::error::{AutogradError, Result};
use crate::graph::Context;
use crate::tensor::Tensor;
use std::sync::Arc;
use tracing::{debug, trace};

/// Rows and columns of a rank-2 tensor.
fn matrix_dims(op: &'static str, t: &Tensor) -> Result<(usize, usize)> {
    match *t.shape()? {
        [rows, cols] => Ok((rows, cols)),
        ref other => Err(AutogradError::shape(
            op,
            format!("expected a rank-2 tensor, got shape {other:?}"),
        )),
    }
}

/// Largest element of every row, shaped `(rows, 1)`.
fn row_max(logits: &NdArray, rows: usize, cols: usize) -> Result<NdArray> {
    let data = if cols == 0 {
        vec![0.0; rows]
    } else {
        logits
            .data()
            .chunks(cols)
            .map(|row| row.iter().copied().fold(f64::NEG_INFINITY, f64::max))
            .collect()
    };
    NdArray::new(vec![rows, 1], data)
}

/// Mean softmax cross-entropy of `logits` (`batch × classes`) against one-hot targets.
///
/// Computes `(sum_i log(sum_j exp(z_ij)) - sum(z * y)) / batch`. The row
/// maximum is subtracted inside the exponent as a constant, which changes
/// neither the value nor the gradient but keeps large logits finite.
///
/// # Errors
///
/// [`AutogradError::ShapeMismatch`] unless both tensors are the same
/// non-empty rank-2 shape.
pub fn softmax_loss(logits: &Tensor, y_one_hot: &Tensor) -> Result<Tensor> {
    let (batch, classes) = matrix_dims("softmax_loss", logits)?;
    if y_one_hot.shape()? != [batch, classes] {
        return Err(AutogradError::shape(
            "softmax_loss",
            format!(
                "targets of shape {:?} for logits of shape {:?}",
                y_one_hot.shape()?,
                [batch, classes]
            ),
        ));
    }
    if batch == 0 {
        return Err(AutogradError::shape("softmax_loss", "empty batch"));
    }

    let max = logits
        .context()
        .constant(row_max(logits.realize()?, batch, classes)?);
    let log_sum_exp = logits
        .sub(&max)?
        .exp()?
        .sum(Some(&[1]))?
        .log()?
        .add(&max.reshape(&[batch])?)?;
    let target = logits.mul(y_one_hot)?.sum(None)?;
    let batch = batch as f64;
    log_sum_exp.sum(None)?.sub(&target)?.div_scalar(batch)
}

/// Mean squared error `sum((prediction - target)^2) / n`.
///
/// # Errors
///
/// [`AutogradError::ShapeMismatch`] if the shapes differ or are empty.
pub fn mse_loss(prediction: &Tensor, target: &Tensor) -> Result<Tensor> {
    let shape = prediction.shape()?;
    if shape != target.shape()? {
        return Err(AutogradError::shape(
            "mse_loss",
            format!("prediction {shape:?} vs target {:?}", target.shape()?),
        ));
    }
    let n = prediction.realize()?.len();
    if n == 0 {
        return Err(AutogradError::shape("mse_loss", "empty prediction"));
    }
    let n = n as f64;
    prediction.sub(target)?.powi(2)?.sum(None)?.div_scalar(n)
}

/// Constant `labels.len() × classes` one-hot matrix.
///
/// # Errors
///
/// [`AutogradError::ShapeMismatch`] if a label is not below `classes`.
pub fn one_hot(ctx: &Arc<Context>, labels: &[usize], classes: usize) -> Result<Tensor> {
    Ok(ctx.constant(ctx.backend().one_hot(labels, classes)?))
}

/// Softmax loss and classification error rate of `logits` against `labels`.
///
/// # Errors
///
/// [`AutogradError::ShapeMismatch`] if `logits` is not rank 2 with one row per label.
pub fn loss_err(logits: &Tensor, labels: &[usize]) -> Result<(f64, f64)> {
    let (rows, classes) = matrix_dims("loss_err", logits)?;
    if rows != labels.len() {
        return Err(AutogradError::shape(
            "loss_err",
            format!("{rows} rows of logits for {} labels", labels.len()),
        ));
    }
    let logits = logits.detach()?;
    let y = one_hot(logits.context(), labels, classes)?;
    let loss = softmax_loss(&logits, &y)?.item()?;

    let wrong = logits
        .realize()?
        .argmax_rows()?
        .iter()
        .zip(labels)
        .filter(|(predicted, label)| predicted != label)
        .count();
    let err = wrong as f64 / rows as f64;
    Ok((loss, err))
}

/// One SGD update, `param - lr * param.grad`, as a fresh parameter leaf.
///
/// The result has no provenance and no gradient. A parameter that never
/// received a gradient comes back with its value unchanged.
///
/// # Errors
///
/// Realization errors of the parameter or its gradient.
pub fn sgd_step(param: &Tensor, lr: f64) -> Result<Tensor> {
    let value = match param.grad() {
        Some(grad) => param.sub(&grad.mul_scalar(lr)?)?.to_array()?,
        None => param.to_array()?,
    };
    Ok(param.context().parameter(value))
}

/// One epoch of minibatch SGD for the classifier `relu(X @ W1) @ W2`.
///
/// `x` holds one example per row and `labels` one class per row. Batches
/// are taken in order; the last one may be short. Returns the updated
/// weights.
///
/// # Errors
///
/// [`AutogradError::ShapeMismatch`] if `x` is not rank 2, the row count and
/// label count differ, `batch` is 0, or the weights do not chain.
pub fn nn_epoch(
    ctx: &Arc<Context>,
    x: &NdArray,
    labels: &[usize],
    mut w1: Tensor,
    mut w2: Tensor,
    lr: f64,
    batch: usize,
) -> Result<(Tensor, Tensor)> {
    let rows = match *x.shape() {
        [rows, _] => rows,
        ref other => {
            return Err(AutogradError::shape(
                "nn_epoch",
                format!("expected rank-2 inputs, got shape {other:?}"),
            ));
        }
    };
    if rows != labels.len() {
        return Err(AutogradError::shape(
            "nn_epoch",
            format!("{rows} examples for {} labels", labels.len()),
        ));
    }
    if batch == 0 {
        return Err(AutogradError::shape("nn_epoch", "batch size must be positive"));
    }
    let (_, classes) = matrix_dims("nn_epoch", &w2)?;

    for start in (0..rows).step_by(batch) {
        let end = (start + batch).min(rows);
        let xb = ctx.constant(x.slice_rows(start, end)?);
        let yb = one_hot(ctx, &labels[start..end], classes)?;

        let logits = xb.matmul(&w1)?.relu()?.matmul(&w2)?;
        let loss = softmax_loss(&logits, &yb)?;
        loss.backward()?;
        trace!(start, end, loss = loss.item()?, "minibatch step");

        w1 = sgd_step(&w1, lr)?;
        w2 = sgd_step(&w2, lr)?;
    }
    debug!(rows, batch, "finished epoch");
    Ok((w1, w2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array;

    #[test]
    fn softmax_loss_of_uniform_logits_is_log_classes() {
        let ctx = Context::cpu();
        let z = ctx.parameter(NdArray::zeros(&[4, 3]));
        let y = one_hot(&ctx, &[0, 1, 2, 0], 3).unwrap();
        let loss = softmax_loss(&z, &y).unwrap().item().unwrap();
        assert!((loss - 3.0_f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn confident_correct_logits_approach_zero_loss() {
        let ctx = Context::cpu();
        let z = ctx.parameter(array!([[50.0, 0.0], [0.0, 50.0]]));
        let y = one_hot(&ctx, &[0, 1], 2).unwrap();
        let loss = softmax_loss(&z, &y).unwrap().item().unwrap();
        assert!(loss.is_finite());
        assert!(loss < 1e-12);
    }

    #[test]
    fn huge_logits_stay_finite() {
        let ctx = Context::cpu();
        let z = ctx.parameter(array!([[1000.0, 0.0]]));
        let y = one_hot(&ctx, &[1], 2).unwrap();
        let loss = softmax_loss(&z, &y).unwrap();
        assert!((loss.item().unwrap() - 1000.0).abs() < 1e-9);
        loss.backward().unwrap();
        let grad = z.grad().unwrap().to_array().unwrap();
        assert!(grad.data().iter().all(|g| g.is_finite()));
    }

    #[test]
    fn softmax_gradient_is_probabilities_minus_targets() {
        let ctx = Context::cpu();
        let z = ctx.parameter(array!([[0.0, 0.0]]));
        let y = one_hot(&ctx, &[1], 2).unwrap();
        softmax_loss(&z, &y).unwrap().backward().unwrap();
        let grad = z.grad().unwrap().to_array().unwrap();
        assert!(grad.all_close(&array!([[0.5, -0.5]]), crate::approx::ApproxEquality::Precise));
    }

    #[test]
    fn softmax_loss_rejects_mismatched_targets() {
        let ctx = Context::cpu();
        let z = ctx.parameter(NdArray::zeros(&[2, 3]));
        let y = one_hot(&ctx, &[0, 1], 2).unwrap();
        assert!(softmax_loss(&z, &y).unwrap_err().is_shape_mismatch());
    }

    #[test]
    fn mse_loss_and_gradient() {
        let ctx = Context::cpu();
        let p = ctx.parameter(array!([1.0, 2.0, 3.0, 4.0]));
        let t = ctx.constant(array!([1.0, 1.0, 1.0, 1.0]));
        let loss = mse_loss(&p, &t).unwrap();
        assert_eq!(loss.item().unwrap(), 3.5);
        loss.backward().unwrap();
        assert_eq!(
            p.grad().unwrap().to_array().unwrap(),
            array!([0.0, 0.5, 1.0, 1.5])
        );
    }

    #[test]
    fn loss_err_counts_wrong_rows() {
        let ctx = Context::cpu();
        let z = ctx.constant(array!([[3.0, 0.0], [0.0, 3.0], [3.0, 0.0], [3.0, 0.0]]));
        let (loss, err) = loss_err(&z, &[0, 1, 1, 0]).unwrap();
        assert!(loss > 0.0);
        assert_eq!(err, 0.25);
        assert!(loss_err(&z, &[0]).unwrap_err().is_shape_mismatch());
    }

    #[test]
    fn sgd_step_moves_against_the_gradient() {
        let ctx = Context::cpu();
        let w = ctx.parameter(array!([1.0, -1.0]));
        w.mul(&w).unwrap().sum(None).unwrap().backward().unwrap();
        let w = sgd_step(&w, 0.25).unwrap();
        assert!(w.is_leaf());
        assert!(w.requires_grad());
        assert!(w.grad().is_none());
        assert_eq!(w.to_array().unwrap(), array!([0.5, -0.5]));

        let untouched = sgd_step(&w, 0.25).unwrap();
        assert_eq!(untouched.to_array().unwrap(), array!([0.5, -0.5]));
    }

    #[test]
    fn nn_epoch_validates_inputs() {
        let ctx = Context::cpu();
        let x = NdArray::zeros(&[4, 2]);
        let w1 = ctx.parameter(NdArray::ones(&[2, 3]));
        let w2 = ctx.parameter(NdArray::ones(&[3, 2]));
        let err = nn_epoch(&ctx, &x, &[0, 1], w1.clone(), w2.clone(), 0.1, 2).unwrap_err();
        assert!(err.is_shape_mismatch());
        let err = nn_epoch(&ctx, &x, &[0, 1, 0, 1], w1, w2, 0.1, 0).unwrap_err();
        assert!(err.is_shape_mismatch());
    }
}
