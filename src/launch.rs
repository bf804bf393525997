//! Host-side launch wrapper.
//!
//! One blocking call per evaluation: validate shapes, stage the host arrays
//! into device buffers, run the selected tile scheme behind a fault
//! boundary, read the output back. Buffers free through RAII on every exit
//! path, so an error in the middle of the sequence leaks nothing.
//!
//! The typed [`evaluate`] is the single generic entry point; the
//! `gauss_*` functions below are the pre-baked status-code surface with the
//! built-in Gaussian kernels and an explicit enumeration over the supported
//! `(DIM_POINT, DIM_VECT)` pairs.

use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, trace};

use crate::device::Device;
use crate::error::{Error, Result};
use crate::formula::{Formula, Gaussian, NegSqDist};
use crate::reduction::{MaxShiftExp, MaxShiftExpKahan, Reduction, Sum};
use crate::scalar::Scalar;
use crate::scheme::{reduce_1d, reduce_2d};

/// Default rows per block; also the tile width.
pub const DEFAULT_BLOCK: usize = 128;

/// Which tile scheme a launch uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    /// One block task per `B` output rows; each block streams all of y.
    Tiled1D,
    /// Grid over (i-block, j-block) pairs plus a partial-merge pass.
    Tiled2D,
}

impl Scheme {
    /// Heuristic choice: split the inner reduction only when the row count
    /// alone cannot occupy the pool and y spans several tiles.
    pub fn for_shape(nx: usize, ny: usize) -> Scheme {
        let row_blocks = nx.div_ceil(DEFAULT_BLOCK);
        let pool = rayon::current_num_threads().max(2);
        if row_blocks < pool && ny > 4 * DEFAULT_BLOCK {
            Scheme::Tiled2D
        } else {
            Scheme::Tiled1D
        }
    }
}

fn check_shape(what: &'static str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(Error::ShapeMismatch {
            what,
            expected,
            got,
        });
    }
    Ok(())
}

/// Run a kernel behind a fault boundary. A panic inside the tile loops
/// (typically a caller-supplied formula) surfaces as an error instead of
/// unwinding across the API.
fn run_kernel(f: impl FnOnce()) -> Result<()> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "kernel panicked".to_string());
        Error::KernelFault(msg)
    })
}

/// Evaluate one reduction over the given clouds.
///
/// `x` is `nx * F::DIM_POINT` scalars row-major, `y` is
/// `ny * F::DIM_POINT`, `b` is `ny * R::DIM_VECT`, and `out` receives
/// `nx * R::DIM_OUT` scalars; `out`'s contents on entry are irrelevant.
/// `params` is broadcast to every pair. Blocks until the evaluation
/// completes; on error the output buffer was never read back and `out` is
/// unspecified.
#[allow(clippy::too_many_arguments)]
pub fn evaluate<T, F, R, const B: usize>(
    device: &Device,
    formula: &F,
    params: &[T],
    x: &[T],
    y: &[T],
    b: &[T],
    out: &mut [T],
    nx: usize,
    ny: usize,
    scheme: Scheme,
) -> Result<()>
where
    T: Scalar,
    F: Formula<T>,
    R: Reduction<T>,
{
    assert!(B.is_power_of_two(), "block size must be a power of two");

    check_shape("params", params.len(), F::DIM_PARAMS)?;
    check_shape("x", x.len(), nx * F::DIM_POINT)?;
    check_shape("y", y.len(), ny * F::DIM_POINT)?;
    check_shape("b", b.len(), ny * R::DIM_VECT)?;
    check_shape("out", out.len(), nx * R::DIM_OUT)?;

    debug!(
        nx,
        ny,
        dim_point = F::DIM_POINT,
        dim_vect = R::DIM_VECT,
        block = B,
        ?scheme,
        "launching tiled reduction"
    );

    let mut dx = device.alloc::<T>(nx * F::DIM_POINT)?;
    let mut dy = device.alloc::<T>(ny * F::DIM_POINT)?;
    let mut db = device.alloc::<T>(ny * R::DIM_VECT)?;
    let mut dout = device.alloc::<T>(nx * R::DIM_OUT)?;

    dx.copy_from_host(x, "x")?;
    dy.copy_from_host(y, "y")?;
    db.copy_from_host(b, "b")?;
    trace!(bytes = device.live_bytes(), "input buffers resident");

    match scheme {
        Scheme::Tiled1D => {
            run_kernel(|| {
                reduce_1d::<T, F, R, B>(
                    formula,
                    params,
                    dx.as_slice(),
                    dy.as_slice(),
                    db.as_slice(),
                    dout.as_mut_slice(),
                    nx,
                    ny,
                )
            })?;
        }
        Scheme::Tiled2D => {
            let jblocks = ny.div_ceil(B);
            let mut dpartials = device.alloc::<T>(jblocks * nx * R::DIM_RED)?;
            run_kernel(|| {
                reduce_2d::<T, F, R, B>(
                    formula,
                    params,
                    dx.as_slice(),
                    dy.as_slice(),
                    db.as_slice(),
                    dpartials.as_mut_slice(),
                    dout.as_mut_slice(),
                    nx,
                    ny,
                )
            })?;
        }
    }

    dout.copy_to_host(out, "out")?;
    trace!("output read back, releasing buffers");
    Ok(())
}

/// Enumerate the compiled `(DIM_POINT, DIM_VECT)` instantiations.
macro_rules! dispatch_dim_pair {
    ($dp:expr, $dv:expr, $run:ident) => {
        match ($dp, $dv) {
            (1, 1) => $run!(1, 1),
            (2, 1) => $run!(2, 1),
            (2, 2) => $run!(2, 2),
            (3, 1) => $run!(3, 1),
            (3, 3) => $run!(3, 3),
            (dp, dv) => Err(Error::UnsupportedDimPair {
                dim_point: dp,
                dim_vect: dv,
            }),
        }
    };
}

fn status(result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            debug!(error = %e, "evaluation failed");
            e.status()
        }
    }
}

/// Gaussian kernel convolution: `out_i = sum_j exp(-p0 |x_i - y_j|^2) b_j`.
///
/// `out` must hold `nx * dim_vect` scalars. Returns `0` on success, `-1`
/// for an unsupported dimension pair, other negatives for device errors.
#[allow(clippy::too_many_arguments)]
pub fn gauss_conv<T: Scalar>(
    params: &[T],
    x: &[T],
    y: &[T],
    b: &[T],
    out: &mut [T],
    dim_point: usize,
    dim_vect: usize,
    nx: usize,
    ny: usize,
) -> i32 {
    let device = Device::new();
    let scheme = Scheme::for_shape(nx, ny);
    macro_rules! run {
        ($dp:literal, $dv:literal) => {
            evaluate::<T, Gaussian<$dp>, Sum<$dv>, DEFAULT_BLOCK>(
                &device,
                &Gaussian::<$dp>,
                params,
                x,
                y,
                b,
                out,
                nx,
                ny,
                scheme,
            )
        };
    }
    status(dispatch_dim_pair!(dim_point, dim_vect, run))
}

/// Gaussian max-shifted-exp reduction over the log-domain score
/// `-p0 |x_i - y_j|^2`, with payload `g`.
///
/// `out` must hold `nx * (1 + dim_vect)` scalars; each row is the `(m, s)`
/// pair, so `m + log(s)` recovers the log-sum-exp.
#[allow(clippy::too_many_arguments)]
pub fn gauss_logsumexp<T: Scalar>(
    params: &[T],
    x: &[T],
    y: &[T],
    g: &[T],
    out: &mut [T],
    dim_point: usize,
    dim_vect: usize,
    nx: usize,
    ny: usize,
) -> i32 {
    let device = Device::new();
    let scheme = Scheme::for_shape(nx, ny);
    macro_rules! run {
        ($dp:literal, $dv:literal) => {
            evaluate::<T, NegSqDist<$dp>, MaxShiftExp<$dv>, DEFAULT_BLOCK>(
                &device,
                &NegSqDist::<$dp>,
                params,
                x,
                y,
                g,
                out,
                nx,
                ny,
                scheme,
            )
        };
    }
    status(dispatch_dim_pair!(dim_point, dim_vect, run))
}

/// As [`gauss_logsumexp`], with Kahan compensation on the mass lanes.
#[allow(clippy::too_many_arguments)]
pub fn gauss_logsumexp_kahan<T: Scalar>(
    params: &[T],
    x: &[T],
    y: &[T],
    g: &[T],
    out: &mut [T],
    dim_point: usize,
    dim_vect: usize,
    nx: usize,
    ny: usize,
) -> i32 {
    let device = Device::new();
    let scheme = Scheme::for_shape(nx, ny);
    macro_rules! run {
        ($dp:literal, $dv:literal) => {
            evaluate::<T, NegSqDist<$dp>, MaxShiftExpKahan<$dv>, DEFAULT_BLOCK>(
                &device,
                &NegSqDist::<$dp>,
                params,
                x,
                y,
                g,
                out,
                nx,
                ny,
                scheme,
            )
        };
    }
    status(dispatch_dim_pair!(dim_point, dim_vect, run))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_is_reported_before_any_allocation() {
        let device = Device::new();
        let mut out = vec![0.0f32; 2];
        // x claims nx = 2 but holds one point.
        let err = evaluate::<f32, Gaussian<1>, Sum<1>, 32>(
            &device,
            &Gaussian::<1>,
            &[1.0],
            &[0.0],
            &[0.0, 1.0],
            &[1.0, 1.0],
            &mut out,
            2,
            2,
            Scheme::Tiled1D,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { what: "x", .. }));
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_alloc_fault_at_every_step_leaks_nothing() {
        let x = [0.0f32, 1.0];
        let y = [0.5f32];
        let b = [2.0f32];
        // Steps 0..4: x, y, b, out for the 1D scheme; step 4 is the
        // partials buffer of the 2D scheme.
        for step in 0..4 {
            let device = Device::new();
            device.fail_alloc_after(step);
            let mut out = vec![0.0f32; 2];
            let err = evaluate::<f32, Gaussian<1>, Sum<1>, 32>(
                &device,
                &Gaussian::<1>,
                &[1.0],
                &x,
                &y,
                &b,
                &mut out,
                2,
                1,
                Scheme::Tiled1D,
            )
            .unwrap_err();
            assert!(matches!(err, Error::AllocFailed { .. }), "step {step}");
            assert_eq!(device.live_buffers(), 0, "leak after failed step {step}");
        }
        let device = Device::new();
        device.fail_alloc_after(4);
        let mut out = vec![0.0f32; 2];
        let err = evaluate::<f32, Gaussian<1>, Sum<1>, 32>(
            &device,
            &Gaussian::<1>,
            &[1.0],
            &x,
            &y,
            &b,
            &mut out,
            2,
            1,
            Scheme::Tiled2D,
        )
        .unwrap_err();
        assert!(matches!(err, Error::AllocFailed { .. }));
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_kernel_panic_surfaces_as_fault_and_frees_buffers() {
        struct Exploding;
        impl Formula<f32> for Exploding {
            const DIM_POINT: usize = 1;
            const DIM_PARAMS: usize = 0;
            fn eval(&self, _x: &[f32], _y: &[f32], _params: &[f32]) -> f32 {
                panic!("synthetic in-kernel fault");
            }
        }

        let device = Device::new();
        let mut out = vec![0.0f32; 1];
        let err = evaluate::<f32, Exploding, Sum<1>, 32>(
            &device,
            &Exploding,
            &[],
            &[0.0],
            &[0.0],
            &[1.0],
            &mut out,
            1,
            1,
            Scheme::Tiled1D,
        )
        .unwrap_err();
        assert!(matches!(err, Error::KernelFault(_)));
        assert_eq!(err.status(), -5);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_unsupported_pair_is_status_minus_one() {
        let mut out = vec![0.0f32; 0];
        let code = gauss_conv::<f32>(&[1.0], &[], &[], &[], &mut out, 4, 5, 0, 0);
        assert_eq!(code, -1);
    }

    #[test]
    fn test_scheme_heuristic_prefers_1d_for_tall_problems() {
        assert_eq!(Scheme::for_shape(1_000_000, 64), Scheme::Tiled1D);
        // A single row block against a deep y cloud wants the split.
        assert_eq!(Scheme::for_shape(4, 1_000_000), Scheme::Tiled2D);
    }
}
