//! Tile-loop kernels.
//!
//! Both schemes implement the same map-reduce without ever materializing
//! the Nx x Ny matrix. The grid is a set of block tasks of `B` output rows
//! each, scheduled onto rayon's pool by work stealing. Within a block, the
//! y cloud streams through a contiguous tile buffer of
//! `B * (DIM_POINT + DIM_VECT)` scalars holding interleaved `[y_j | b_j]`
//! records — a flat scalar array addressed by stride, not a typed record,
//! so one base pointer walks both fields. Each y element is read from the
//! global buffers exactly once per block; each owned row then walks the
//! resident tile against its register-cached `x_i`.
//!
//! The load phase of a tile fully precedes the consume phase, which is the
//! host-side equivalent of the two intra-block barriers of the tiled
//! scheme. Per row, the j traversal is sequential and independent of task
//! scheduling, so for a fixed `B` the output is bit-identical across runs.

use rayon::prelude::*;

use crate::formula::Formula;
use crate::reduction::Reduction;
use crate::scalar::Scalar;

/// Load `width` interleaved `[y_j | b_j]` records starting at `jstart`.
#[inline]
fn load_tile<T: Scalar>(
    tile: &mut [T],
    y: &[T],
    b: &[T],
    jstart: usize,
    width: usize,
    dp: usize,
    dv: usize,
) {
    let rec = dp + dv;
    for r in 0..width {
        let j = jstart + r;
        tile[r * rec..r * rec + dp].copy_from_slice(&y[j * dp..(j + 1) * dp]);
        tile[r * rec + dp..(r + 1) * rec].copy_from_slice(&b[j * dv..(j + 1) * dv]);
    }
}

/// One-dimensional scheme: one block task per `B` output rows, every block
/// streams the whole y cloud.
pub(crate) fn reduce_1d<T, F, R, const B: usize>(
    formula: &F,
    params: &[T],
    x: &[T],
    y: &[T],
    b: &[T],
    out: &mut [T],
    nx: usize,
    ny: usize,
) where
    T: Scalar,
    F: Formula<T>,
    R: Reduction<T>,
{
    if nx == 0 {
        return;
    }
    let dp = F::DIM_POINT;
    let dv = R::DIM_VECT;
    let rec = dp + dv;

    out.par_chunks_mut(B * R::DIM_OUT)
        .enumerate()
        .for_each(|(blk, out_block)| {
            let i0 = blk * B;
            let rows = out_block.len() / R::DIM_OUT;

            // Block-local accumulator and compensation scratch, one row
            // per owned i. Written once per combine, stays cache-hot.
            let mut acc = vec![T::ZERO; rows * R::DIM_RED];
            let mut comp = vec![T::ZERO; rows * R::DIM_COMP];
            for row in acc.chunks_mut(R::DIM_RED) {
                R::init(row);
            }

            let mut tile = vec![T::ZERO; B * rec];

            let mut jstart = 0;
            while jstart < ny {
                let width = (ny - jstart).min(B);
                load_tile(&mut tile, y, b, jstart, width, dp, dv);

                for r_i in 0..rows {
                    let i = i0 + r_i;
                    let xi = &x[i * dp..(i + 1) * dp];
                    let acc_row = &mut acc[r_i * R::DIM_RED..(r_i + 1) * R::DIM_RED];
                    let comp_row = &mut comp[r_i * R::DIM_COMP..(r_i + 1) * R::DIM_COMP];
                    for rel in 0..width {
                        // SAFETY: rel < width <= B and the tile holds
                        // B * rec scalars, so rel * rec + rec <= tile.len().
                        let record = unsafe { tile.get_unchecked(rel * rec..(rel + 1) * rec) };
                        let (yj, bj) = record.split_at(dp);
                        let v = formula.eval(xi, yj, params);
                        R::combine(acc_row, comp_row, v, bj);
                    }
                }

                jstart += B;
            }

            for (acc_row, out_row) in acc.chunks(R::DIM_RED).zip(out_block.chunks_mut(R::DIM_OUT))
            {
                R::finalize(acc_row, out_row);
            }
        });
}

/// Two-dimensional scheme: a grid over (i-block, j-block) pairs fills a
/// partials buffer of shape `[jblock][i][DIM_RED]`; a second pass folds the
/// j-block partials per row with the descriptor's own merge.
///
/// Splitting the inner reduction recovers parallelism when the row count
/// alone cannot occupy the pool. Agreement with the one-dimensional scheme
/// holds up to floating-point reassociation because merge is associative
/// and commutative.
pub(crate) fn reduce_2d<T, F, R, const B: usize>(
    formula: &F,
    params: &[T],
    x: &[T],
    y: &[T],
    b: &[T],
    partials: &mut [T],
    out: &mut [T],
    nx: usize,
    ny: usize,
) where
    T: Scalar,
    F: Formula<T>,
    R: Reduction<T>,
{
    if nx == 0 {
        return;
    }
    let dp = F::DIM_POINT;
    let dv = R::DIM_VECT;
    let rec = dp + dv;
    let jblocks = ny.div_ceil(B);
    debug_assert_eq!(partials.len(), jblocks * nx * R::DIM_RED);

    // Pass 1: partial accumulators. Each j-block slab loads its tile once
    // and shares it read-only across the i-block tasks underneath.
    partials
        .par_chunks_mut(nx * R::DIM_RED)
        .enumerate()
        .for_each(|(jblk, slab)| {
            let jstart = jblk * B;
            let width = (ny - jstart).min(B);

            let mut tile = vec![T::ZERO; width * rec];
            load_tile(&mut tile, y, b, jstart, width, dp, dv);
            let tile = &tile;

            slab.par_chunks_mut(B * R::DIM_RED)
                .enumerate()
                .for_each(|(iblk, accs)| {
                    let i0 = iblk * B;
                    let rows = accs.len() / R::DIM_RED;
                    let mut comp = vec![T::ZERO; rows * R::DIM_COMP];

                    for (r_i, acc_row) in accs.chunks_mut(R::DIM_RED).enumerate() {
                        R::init(acc_row);
                        let i = i0 + r_i;
                        let xi = &x[i * dp..(i + 1) * dp];
                        let comp_row =
                            &mut comp[r_i * R::DIM_COMP..(r_i + 1) * R::DIM_COMP];
                        for rel in 0..width {
                            let record = &tile[rel * rec..(rel + 1) * rec];
                            let (yj, bj) = record.split_at(dp);
                            let v = formula.eval(xi, yj, params);
                            R::combine(acc_row, comp_row, v, bj);
                        }
                    }
                });
        });

    // Pass 2: fold the j-block partials per row, ascending jblock order so
    // the result is deterministic for a fixed B.
    let partials = &*partials;
    let stride = nx * R::DIM_RED;
    out.par_chunks_mut(R::DIM_OUT)
        .enumerate()
        .for_each(|(i, out_row)| {
            let mut acc = vec![T::ZERO; R::DIM_RED];
            let mut comp = vec![T::ZERO; R::DIM_COMP];
            R::init(&mut acc);
            for jblk in 0..jblocks {
                let base = jblk * stride + i * R::DIM_RED;
                R::merge(&mut acc, &mut comp, &partials[base..base + R::DIM_RED]);
            }
            R::finalize(&acc, out_row);
        });
}
