//! Parallel CPU backend.
//!
//! This is the default [`Backend`]. Element-wise maps, broadcasts, axis
//! permutations and matrix-multiply rows are spread over the
//! [`rayon`](https://docs.rs/rayon) pool once the amount of work crosses the
//! configured threshold; smaller arrays run on the calling thread because
//! scheduling would cost more than the arithmetic.
//!
//! ## Design Goals
//!
//! - Deterministic results: the parallel and sequential paths produce
//!   identical output (every element is computed by exactly one task)
//! - No dependencies beyond `rayon`
//! - Pure kernels: operands are borrowed, results are freshly allocated

use super::{Backend, BinaryOp, ScalarOp, UnaryOp, broadcast_shapes};
use crate::array::{NdArray, numel, row_major_strides};
use crate::error::{AutogradError, Result};
use rayon::prelude::*;

/// Element count from which [`CpuBackend::new`] parallelises a kernel.
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 4096;

/// Reference CPU implementation of [`Backend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuBackend {
    parallel_threshold: usize,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBackend {
    /// A backend that parallelises kernels of at least
    /// [`DEFAULT_PARALLEL_THRESHOLD`] elements.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
        }
    }

    /// A backend that never leaves the calling thread.
    #[must_use]
    pub const fn sequential() -> Self {
        Self {
            parallel_threshold: usize::MAX,
        }
    }

    /// Sets the amount of work (in multiply-adds or output elements) from
    /// which kernels run on the rayon pool.
    #[must_use]
    pub const fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    /// The configured parallelisation threshold.
    #[must_use]
    pub const fn parallel_threshold(&self) -> usize {
        self.parallel_threshold
    }

    fn is_parallel(&self, work: usize) -> bool {
        work >= self.parallel_threshold
    }

    fn map<F>(&self, x: &NdArray, f: F) -> NdArray
    where
        F: Fn(f64) -> f64 + Send + Sync,
    {
        let data = if self.is_parallel(x.len()) {
            x.data().par_iter().map(|&v| f(v)).collect()
        } else {
            x.data().iter().map(|&v| f(v)).collect()
        };
        NdArray::from_parts(x.shape().to_vec(), data)
    }

    /// Reads `src` through `strides` for every index of `shape`.
    fn gather(&self, shape: &[usize], strides: &[usize], src: &[f64]) -> Vec<f64> {
        let n = numel(shape);
        let read = |i: usize| src[offset(i, shape, strides)];
        if self.is_parallel(n) {
            (0..n).into_par_iter().map(read).collect()
        } else {
            (0..n).map(read).collect()
        }
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn binary(&self, op: BinaryOp, lhs: &NdArray, rhs: &NdArray) -> Result<NdArray> {
        if lhs.shape() == rhs.shape() {
            let data = if self.is_parallel(lhs.len()) {
                lhs.data()
                    .par_iter()
                    .zip(rhs.data())
                    .map(|(&a, &b)| op.apply(a, b))
                    .collect()
            } else {
                lhs.data()
                    .iter()
                    .zip(rhs.data())
                    .map(|(&a, &b)| op.apply(a, b))
                    .collect()
            };
            return Ok(NdArray::from_parts(lhs.shape().to_vec(), data));
        }

        let shape = broadcast_shapes(lhs.shape(), rhs.shape()).map_err(|_| {
            AutogradError::shape(
                op.name(),
                format!("cannot broadcast {:?} with {:?}", lhs.shape(), rhs.shape()),
            )
        })?;
        let lhs_strides = broadcast_strides(lhs.shape(), &shape);
        let rhs_strides = broadcast_strides(rhs.shape(), &shape);
        let (a, b) = (lhs.data(), rhs.data());
        let eval = |i: usize| {
            op.apply(
                a[offset(i, &shape, &lhs_strides)],
                b[offset(i, &shape, &rhs_strides)],
            )
        };

        let n = numel(&shape);
        let data = if self.is_parallel(n) {
            (0..n).into_par_iter().map(eval).collect()
        } else {
            (0..n).map(eval).collect()
        };
        Ok(NdArray::from_parts(shape, data))
    }

    fn scalar(&self, op: ScalarOp, x: &NdArray, scalar: f64) -> NdArray {
        self.map(x, |v| op.apply(v, scalar))
    }

    fn unary(&self, op: UnaryOp, x: &NdArray) -> NdArray {
        self.map(x, |v| op.apply(v))
    }

    fn powi(&self, x: &NdArray, exponent: i32) -> NdArray {
        self.map(x, |v| v.powi(exponent))
    }

    fn positive_mask(&self, x: &NdArray) -> NdArray {
        self.map(x, |v| if v > 0.0 { 1.0 } else { 0.0 })
    }

    fn sum(&self, x: &NdArray, axes: Option<&[usize]>) -> Result<NdArray> {
        let Some(axes) = axes else {
            return Ok(NdArray::scalar(x.data().iter().sum()));
        };

        let ndim = x.ndim();
        let mut reduced = vec![false; ndim];
        for &axis in axes {
            if axis >= ndim {
                return Err(AutogradError::shape(
                    "summation",
                    format!("axis {axis} is out of range for shape {:?}", x.shape()),
                ));
            }
            if reduced[axis] {
                return Err(AutogradError::shape(
                    "summation",
                    format!("axis {axis} is repeated in {axes:?}"),
                ));
            }
            reduced[axis] = true;
        }

        let out_shape: Vec<usize> = x
            .shape()
            .iter()
            .zip(&reduced)
            .filter(|&(_, &r)| !r)
            .map(|(&d, _)| d)
            .collect();
        let out_strides = row_major_strides(&out_shape);

        // reduced axes scatter with stride 0 so their elements collide
        let mut scatter = vec![0; ndim];
        let mut kept = out_strides.iter();
        for (stride, &r) in scatter.iter_mut().zip(&reduced) {
            if !r {
                *stride = kept.next().copied().unwrap_or(0);
            }
        }

        let mut out = vec![0.0; numel(&out_shape)];
        for (i, &v) in x.data().iter().enumerate() {
            out[offset(i, x.shape(), &scatter)] += v;
        }
        Ok(NdArray::from_parts(out_shape, out))
    }

    fn broadcast_to(&self, x: &NdArray, shape: &[usize]) -> Result<NdArray> {
        let incompatible = || {
            AutogradError::shape(
                "broadcast_to",
                format!("cannot broadcast {:?} to {shape:?}", x.shape()),
            )
        };
        let lead = shape
            .len()
            .checked_sub(x.ndim())
            .ok_or_else(incompatible)?;
        let fits = x
            .shape()
            .iter()
            .zip(&shape[lead..])
            .all(|(&d, &t)| d == t || d == 1);
        if !fits {
            return Err(incompatible());
        }

        let strides = broadcast_strides(x.shape(), shape);
        let data = self.gather(shape, &strides, x.data());
        Ok(NdArray::from_parts(shape.to_vec(), data))
    }

    fn reshape(&self, x: &NdArray, shape: &[usize]) -> Result<NdArray> {
        if numel(shape) != x.len() {
            return Err(AutogradError::shape(
                "reshape",
                format!("cannot reshape {:?} into {shape:?}", x.shape()),
            ));
        }
        Ok(NdArray::from_parts(shape.to_vec(), x.data().to_vec()))
    }

    fn permute(&self, x: &NdArray, axes: &[usize]) -> Result<NdArray> {
        let ndim = x.ndim();
        let mut seen = vec![false; ndim];
        let valid = axes.len() == ndim
            && axes
                .iter()
                .all(|&a| a < ndim && !std::mem::replace(&mut seen[a], true));
        if !valid {
            return Err(AutogradError::shape(
                "transpose",
                format!("{axes:?} is not a permutation of the axes of {:?}", x.shape()),
            ));
        }

        let src_strides = row_major_strides(x.shape());
        let shape: Vec<usize> = axes.iter().map(|&a| x.shape()[a]).collect();
        let strides: Vec<usize> = axes.iter().map(|&a| src_strides[a]).collect();
        let data = self.gather(&shape, &strides, x.data());
        Ok(NdArray::from_parts(shape, data))
    }

    fn matmul(&self, lhs: &NdArray, rhs: &NdArray) -> Result<NdArray> {
        let (a_shape, b_shape) = (lhs.shape(), rhs.shape());
        if a_shape.len() < 2 || b_shape.len() < 2 {
            return Err(AutogradError::shape(
                "matmul",
                format!("operands need rank >= 2, got {a_shape:?} @ {b_shape:?}"),
            ));
        }

        let (a_batch, a_mat) = a_shape.split_at(a_shape.len() - 2);
        let (b_batch, b_mat) = b_shape.split_at(b_shape.len() - 2);
        let (m, k) = (a_mat[0], a_mat[1]);
        let (k2, n) = (b_mat[0], b_mat[1]);
        if k != k2 {
            return Err(AutogradError::shape(
                "matmul",
                format!("inner dimensions must match, got {a_shape:?} @ {b_shape:?}"),
            ));
        }

        let batch = broadcast_shapes(a_batch, b_batch).map_err(|_| {
            AutogradError::shape(
                "matmul",
                format!("batch dimensions do not broadcast in {a_shape:?} @ {b_shape:?}"),
            )
        })?;
        // strides in whole matrices
        let a_strides = broadcast_strides(a_batch, &batch);
        let b_strides = broadcast_strides(b_batch, &batch);

        let mut shape = batch.clone();
        shape.extend([m, n]);
        let mut out = vec![0.0; numel(&shape)];
        let (a, b) = (lhs.data(), rhs.data());

        let row = |(r, out_row): (usize, &mut [f64])| {
            let (bi, i) = (r / m, r % m);
            let a_base = offset(bi, &batch, &a_strides) * m * k + i * k;
            let b_base = offset(bi, &batch, &b_strides) * k * n;
            for (l, &a_il) in a[a_base..a_base + k].iter().enumerate() {
                let b_row = &b[b_base + l * n..b_base + (l + 1) * n];
                for (o, &b_lj) in out_row.iter_mut().zip(b_row) {
                    *o += a_il * b_lj;
                }
            }
        };

        if n > 0 {
            if self.is_parallel(out.len() * k.max(1)) {
                out.par_chunks_mut(n).enumerate().for_each(row);
            } else {
                out.chunks_mut(n).enumerate().for_each(row);
            }
        }
        Ok(NdArray::from_parts(shape, out))
    }
}

/// Strides of `src` when read as the broadcast shape `out`.
///
/// Missing leading axes and size-1 axes get stride 0. Requires
/// `out.len() >= src.len()`.
fn broadcast_strides(src: &[usize], out: &[usize]) -> Vec<usize> {
    let src_strides = row_major_strides(src);
    let lead = out.len() - src.len();
    (0..out.len())
        .map(|i| match i.checked_sub(lead) {
            Some(j) if src[j] != 1 => src_strides[j],
            _ => 0,
        })
        .collect()
}

/// Memory offset of row-major index `flat` of `shape` under `strides`.
///
/// `shape` must not contain a zero dimension.
#[inline]
fn offset(mut flat: usize, shape: &[usize], strides: &[usize]) -> usize {
    let mut off = 0;
    for (&dim, &stride) in shape.iter().zip(strides).rev() {
        off += (flat % dim) * stride;
        flat /= dim;
    }
    off
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array;

    #[test]
    fn binary_broadcasts_column_against_row() {
        let cpu = CpuBackend::new();
        let col = array!([[1.0], [2.0], [3.0]]);
        let row = array!([10.0, 20.0]);
        let out = cpu.binary(BinaryOp::Add, &col, &row).unwrap();
        assert_eq!(out.shape(), &[3, 2]);
        assert_eq!(out.data(), &[11.0, 21.0, 12.0, 22.0, 13.0, 23.0]);
    }

    #[test]
    fn binary_rejects_incompatible_shapes() {
        let cpu = CpuBackend::new();
        let err = cpu
            .binary(BinaryOp::Mul, &NdArray::ones(&[2, 3]), &NdArray::ones(&[3, 2]))
            .unwrap_err();
        assert!(err.is_shape_mismatch());
    }

    #[test]
    fn sum_over_axes_drops_them() {
        let cpu = CpuBackend::new();
        let x = array!([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        assert_eq!(cpu.sum(&x, Some(&[0])).unwrap().data(), &[5.0, 7.0, 9.0]);
        assert_eq!(cpu.sum(&x, Some(&[1])).unwrap().data(), &[6.0, 15.0]);
        let all = cpu.sum(&x, None).unwrap();
        assert!(all.shape().is_empty());
        assert_eq!(all.item().unwrap(), 21.0);
        assert_eq!(cpu.sum(&x, Some(&[])).unwrap(), x);
        assert!(cpu.sum(&x, Some(&[2])).is_err());
        assert!(cpu.sum(&x, Some(&[1, 1])).is_err());
    }

    #[test]
    fn permute_swaps_axes() {
        let cpu = CpuBackend::new();
        let x = array!([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let t = cpu.permute(&x, &[1, 0]).unwrap();
        assert_eq!(t.shape(), &[3, 2]);
        assert_eq!(t.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert!(cpu.permute(&x, &[0, 0]).is_err());
    }

    #[test]
    fn broadcast_to_adds_leading_axes() {
        let cpu = CpuBackend::new();
        let x = array!([[1.0], [2.0]]);
        let b = cpu.broadcast_to(&x, &[2, 2, 3]).unwrap();
        assert_eq!(b.shape(), &[2, 2, 3]);
        assert_eq!(&b.data()[..6], &[1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
        assert!(cpu.broadcast_to(&x, &[3]).is_err());
        assert!(cpu.broadcast_to(&x, &[3, 3]).is_err());
    }

    #[test]
    fn matmul_matches_hand_computation() {
        let cpu = CpuBackend::new();
        let a = array!([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let b = array!([[7.0, 8.0], [9.0, 10.0], [11.0, 12.0]]);
        let c = cpu.matmul(&a, &b).unwrap();
        assert_eq!(c.shape(), &[2, 2]);
        assert_eq!(c.data(), &[58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn matmul_broadcasts_batch_dims() {
        let cpu = CpuBackend::new();
        let a = NdArray::new(vec![2, 2, 3], (0..12).map(|v| v as f64).collect()).unwrap();
        let b = array!([[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]]);
        let c = cpu.matmul(&a, &b).unwrap();
        assert_eq!(c.shape(), &[2, 2, 2]);
        assert_eq!(c.data(), &[2.0, 3.0, 8.0, 9.0, 14.0, 15.0, 20.0, 21.0]);
    }

    #[test]
    fn matmul_rejects_bad_inner_dims() {
        let cpu = CpuBackend::new();
        let err = cpu
            .matmul(&NdArray::ones(&[2, 3]), &NdArray::ones(&[4, 2]))
            .unwrap_err();
        assert!(err.is_shape_mismatch());
        assert!(cpu.matmul(&NdArray::ones(&[3]), &NdArray::ones(&[3, 1])).is_err());
    }

    #[test]
    fn parallel_and_sequential_paths_agree() {
        let a = NdArray::new(vec![64, 48], (0..64 * 48).map(|v| (v % 7) as f64 - 3.0).collect())
            .unwrap();
        let b = NdArray::new(vec![48, 80], (0..48 * 80).map(|v| (v % 5) as f64 * 0.5).collect())
            .unwrap();
        let par = CpuBackend::new().with_parallel_threshold(1);
        let seq = CpuBackend::sequential();
        assert_eq!(par.matmul(&a, &b).unwrap(), seq.matmul(&a, &b).unwrap());
        assert_eq!(
            par.permute(&a, &[1, 0]).unwrap(),
            seq.permute(&a, &[1, 0]).unwrap()
        );
        assert_eq!(
            par.unary(UnaryOp::Exp, &a),
            seq.unary(UnaryOp::Exp, &a)
        );
    }
}
