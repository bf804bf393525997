//! Reduction descriptors.
//!
//! A reduction is four device-callable operations over a small accumulator
//! row: a neutral element, a pair-combine, a partial-merge, and a finalize.
//! The tile loops are generic over the descriptor type, so the family is
//! fixed at compile time and `combine` contains no variant branch — the
//! Kahan-compensated flavors are separate types, not a runtime flag.
//!
//! Two families are provided:
//!
//! * **Sum**: `acc[k] += f_ij * b_j[k]`. `DIM_RED == DIM_VECT`.
//! * **Max-shifted exponential**: the coupled pair
//!   `(m, s) = (max_j f_ij, sum_j exp(f_ij - m) * g_j)`. The first
//!   accumulator lane is the running maximum, the remaining lanes carry the
//!   shifted mass. Every `exp` argument is <= 0, so the reduction cannot
//!   overflow regardless of the score magnitudes; `m + log(s)` downstream
//!   recovers the log-sum-exp.

use crate::scalar::Scalar;

/// A reduction family, parameterized by the payload width.
///
/// `combine` and `merge` are associative and commutative up to
/// floating-point reassociation, which is what allows the two-dimensional
/// scheme to fold per-block partials in any grouping.
pub trait Reduction<T: Scalar>: Send + Sync {
    /// Payload width expected per y point.
    const DIM_VECT: usize;
    /// Accumulator width.
    const DIM_RED: usize;
    /// Output row width.
    const DIM_OUT: usize;
    /// Compensation width; zero for the uncompensated flavors.
    const DIM_COMP: usize;

    /// Set `acc` to the neutral element.
    fn init(acc: &mut [T]);

    /// Fold one `(f_ij, payload_j)` pair into the accumulator.
    fn combine(acc: &mut [T], comp: &mut [T], value: T, payload: &[T]);

    /// Fold a partial accumulator produced by another block.
    fn merge(acc: &mut [T], comp: &mut [T], partial: &[T]);

    /// Write the accumulator to the output row.
    fn finalize(acc: &[T], out: &mut [T]);
}

/// One compensated addition step.
///
/// The compensation is subtracted from the incoming term, not from the
/// accumulator, so when no precision is lost this reduces to an ordinary
/// add plus two subtractions that cancel.
#[inline(always)]
pub(crate) fn kahan_add<T: Scalar>(sum: &mut T, comp: &mut T, term: T) {
    let y = term - *comp;
    let t = *sum + y;
    *comp = (t - *sum) - y;
    *sum = t;
}

// ─── Sum family ───────────────────────────────────────────────────────────────

/// Plain weighted sum: `acc[k] += value * payload[k]`.
pub struct Sum<const DV: usize>;

impl<T: Scalar, const DV: usize> Reduction<T> for Sum<DV> {
    const DIM_VECT: usize = DV;
    const DIM_RED: usize = DV;
    const DIM_OUT: usize = DV;
    const DIM_COMP: usize = 0;

    #[inline(always)]
    fn init(acc: &mut [T]) {
        for a in acc.iter_mut() {
            *a = T::ZERO;
        }
    }

    #[inline(always)]
    fn combine(acc: &mut [T], _comp: &mut [T], value: T, payload: &[T]) {
        for (a, &b) in acc.iter_mut().zip(payload) {
            *a = *a + value * b;
        }
    }

    #[inline(always)]
    fn merge(acc: &mut [T], comp: &mut [T], partial: &[T]) {
        Self::combine(acc, comp, T::ONE, partial);
    }

    #[inline(always)]
    fn finalize(acc: &[T], out: &mut [T]) {
        out.copy_from_slice(acc);
    }
}

/// Kahan-compensated weighted sum. Same accumulator layout as [`Sum`], with
/// one compensation lane per payload lane carrying the lost low-order bits
/// between combines.
pub struct SumKahan<const DV: usize>;

impl<T: Scalar, const DV: usize> Reduction<T> for SumKahan<DV> {
    const DIM_VECT: usize = DV;
    const DIM_RED: usize = DV;
    const DIM_OUT: usize = DV;
    const DIM_COMP: usize = DV;

    #[inline(always)]
    fn init(acc: &mut [T]) {
        for a in acc.iter_mut() {
            *a = T::ZERO;
        }
    }

    #[inline(always)]
    fn combine(acc: &mut [T], comp: &mut [T], value: T, payload: &[T]) {
        for ((a, c), &b) in acc.iter_mut().zip(comp.iter_mut()).zip(payload) {
            kahan_add(a, c, value * b);
        }
    }

    #[inline(always)]
    fn merge(acc: &mut [T], comp: &mut [T], partial: &[T]) {
        Self::combine(acc, comp, T::ONE, partial);
    }

    #[inline(always)]
    fn finalize(acc: &[T], out: &mut [T]) {
        out.copy_from_slice(acc);
    }
}

// ─── Max-shifted exponential family ───────────────────────────────────────────

/// Max-shifted exponential reduction.
///
/// Accumulator layout: `[m, s_0, .., s_{DV-1}]` with the invariant that
/// after every combine, `m` is the maximum score seen so far and `s` is the
/// payload mass shifted by `m`. The neutral element is `(-inf, 0, ..)`,
/// which is absorbing because `exp(-inf) * 0 == 0`.
pub struct MaxShiftExp<const DV: usize>;

impl<T: Scalar, const DV: usize> Reduction<T> for MaxShiftExp<DV> {
    const DIM_VECT: usize = DV;
    const DIM_RED: usize = DV + 1;
    const DIM_OUT: usize = DV + 1;
    const DIM_COMP: usize = 0;

    #[inline(always)]
    fn init(acc: &mut [T]) {
        acc[0] = T::NEG_INFINITY;
        for a in acc[1..].iter_mut() {
            *a = T::ZERO;
        }
    }

    #[inline(always)]
    fn combine(acc: &mut [T], _comp: &mut [T], value: T, payload: &[T]) {
        let (head, lanes) = acc.split_at_mut(1);
        let m = head[0];
        if value <= m {
            // Shift the incoming term down to the running reference.
            let t = (value - m).exp();
            for (a, &g) in lanes.iter_mut().zip(payload) {
                *a = *a + g * t;
            }
        } else {
            // New maximum: rescale the accumulated mass, then absorb.
            let t = (m - value).exp();
            for (a, &g) in lanes.iter_mut().zip(payload) {
                *a = g + t * *a;
            }
            head[0] = value;
        }
    }

    #[inline(always)]
    fn merge(acc: &mut [T], comp: &mut [T], partial: &[T]) {
        // A still-neutral partial must not be folded in: both maxima at
        // -inf would put exp(-inf - -inf) = exp(NaN) on the lanes.
        if partial[0] == T::NEG_INFINITY {
            return;
        }
        Self::combine(acc, comp, partial[0], &partial[1..]);
    }

    #[inline(always)]
    fn finalize(acc: &[T], out: &mut [T]) {
        // The (m, s) pair is written verbatim; `m + log(s)` is the caller's.
        out.copy_from_slice(acc);
    }
}

/// Kahan-compensated max-shifted exponential. The mass lanes are
/// compensated; the max lane is exact by construction and carries none.
pub struct MaxShiftExpKahan<const DV: usize>;

impl<T: Scalar, const DV: usize> Reduction<T> for MaxShiftExpKahan<DV> {
    const DIM_VECT: usize = DV;
    const DIM_RED: usize = DV + 1;
    const DIM_OUT: usize = DV + 1;
    const DIM_COMP: usize = DV;

    #[inline(always)]
    fn init(acc: &mut [T]) {
        acc[0] = T::NEG_INFINITY;
        for a in acc[1..].iter_mut() {
            *a = T::ZERO;
        }
    }

    #[inline(always)]
    fn combine(acc: &mut [T], comp: &mut [T], value: T, payload: &[T]) {
        let (head, lanes) = acc.split_at_mut(1);
        let m = head[0];
        if value <= m {
            let t = (value - m).exp();
            for ((a, c), &g) in lanes.iter_mut().zip(comp.iter_mut()).zip(payload) {
                kahan_add(a, c, g * t);
            }
        } else {
            // Rescaling must touch the compensation lanes too, or the
            // carried bits would stay at the old reference.
            let t = (m - value).exp();
            for ((a, c), &g) in lanes.iter_mut().zip(comp.iter_mut()).zip(payload) {
                *a = *a * t;
                *c = *c * t;
                kahan_add(a, c, g);
            }
            head[0] = value;
        }
    }

    #[inline(always)]
    fn merge(acc: &mut [T], comp: &mut [T], partial: &[T]) {
        if partial[0] == T::NEG_INFINITY {
            return;
        }
        Self::combine(acc, comp, partial[0], &partial[1..]);
    }

    #[inline(always)]
    fn finalize(acc: &[T], out: &mut [T]) {
        out.copy_from_slice(acc);
    }
}
