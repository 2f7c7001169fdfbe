//! Graded approximate equality for floats and arrays.
//!
//! Differences are measured relative to the larger magnitude of the two values
//! (or absolutely when both are below 1), then bucketed into an
//! [`ApproxEquality`] grade. Comparing collections reports the worst grade of
//! any element pair.

/// Relative error below which values are [`ApproxEquality::Precise`].
pub const F64_MIN_ERROR: f64 = 1e-12;

/// Relative error below which values are [`ApproxEquality::Partial`].
pub const F64_AVG_ERROR: f64 = 1e-6;

/// Relative error below which values are [`ApproxEquality::Relative`].
pub const F64_MAX_ERROR: f64 = 1e-3;

/// How closely two values agree, best grade first.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    /// Within [`F64_MIN_ERROR`].
    Precise = 0,
    /// Within [`F64_AVG_ERROR`].
    Partial = 1,
    /// Within [`F64_MAX_ERROR`].
    Relative = 2,
    /// Not equal, or shapes differ.
    Scarce = 3,
}

/// Grades the distance between `self` and `rhs`.
pub trait RelativeEq<Rhs: ?Sized> {
    /// The grade of equality between `self` and `rhs`.
    fn approx_eq(&self, rhs: &Rhs) -> ApproxEquality;
}

impl RelativeEq<Self> for f64 {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        if self == rhs {
            // covers equal infinities
            return ApproxEquality::Precise;
        }
        let scale = self.abs().max(rhs.abs()).max(1.0);
        let dif = (self - rhs).abs() / scale;

        if dif < F64_MIN_ERROR {
            ApproxEquality::Precise
        } else if dif < F64_AVG_ERROR {
            ApproxEquality::Partial
        } else if dif < F64_MAX_ERROR {
            ApproxEquality::Relative
        } else {
            // NaN lands here too
            ApproxEquality::Scarce
        }
    }
}

impl RelativeEq<[f64]> for [f64] {
    fn approx_eq(&self, rhs: &[f64]) -> ApproxEquality {
        if self.len() != rhs.len() {
            return ApproxEquality::Scarce;
        }
        let mut worst = ApproxEquality::Precise;
        for (a, b) in self.iter().zip(rhs) {
            worst = worst.max(a.approx_eq(b));
            if worst == ApproxEquality::Scarce {
                break;
            }
        }
        worst
    }
}

/// Whether `a` and `b` agree to at least [`ApproxEquality::Partial`].
#[must_use]
pub fn approx_eq<A: RelativeEq<B> + ?Sized, B: ?Sized>(a: &A, b: &B) -> bool {
    a.approx_eq(b) <= ApproxEquality::Partial
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grades_scalar_distances() {
        assert_eq!(1.0_f64.approx_eq(&1.0), ApproxEquality::Precise);
        assert_eq!(1.0_f64.approx_eq(&(1.0 + 1e-8)), ApproxEquality::Partial);
        assert_eq!(1.0_f64.approx_eq(&1.0001), ApproxEquality::Relative);
        assert_eq!(1.0_f64.approx_eq(&1.1), ApproxEquality::Scarce);
        assert_eq!(f64::NAN.approx_eq(&f64::NAN), ApproxEquality::Scarce);
    }

    #[test]
    fn large_values_compare_relatively() {
        assert_eq!(1e9_f64.approx_eq(&(1e9 + 1e-2)), ApproxEquality::Partial);
    }

    #[test]
    fn slices_report_worst_grade() {
        let a = [1.0, 2.0, 3.0];
        let b = [1.0, 2.0 + 1e-8, 3.0001];
        assert_eq!(a[..].approx_eq(&b[..]), ApproxEquality::Relative);
        assert!(!approx_eq(&a[..], &b[..]));
        assert_eq!(a[..].approx_eq(&a[..2]), ApproxEquality::Scarce);
    }
}
