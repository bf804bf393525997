//! Error surface of the engine.
//!
//! The typed API returns `Result<(), Error>`; the status-code entry points
//! flatten every variant to a single negative integer because downstream
//! bindings expect exactly that shape.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The requested (point, payload) dimension pair is not among the
    /// compiled instantiations.
    #[error("unsupported dimension pair ({dim_point}, {dim_vect})")]
    UnsupportedDimPair { dim_point: usize, dim_vect: usize },

    /// A host array does not match its declared shape.
    #[error("shape mismatch for `{what}`: expected {expected} scalars, got {got}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// The device refused an allocation.
    #[error("device allocation of {bytes} bytes failed")]
    AllocFailed { bytes: usize },

    /// A host<->device transfer had mismatched endpoints.
    #[error("copy failed for `{what}`: buffer holds {expected} scalars, peer has {got}")]
    CopyFailed {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// A kernel aborted mid-flight; the output buffer was never read back.
    #[error("kernel fault: {0}")]
    KernelFault(String),
}

impl Error {
    /// Collapse to the integer status contract: `0` is success, `-1` is an
    /// unsupported dimension pair, the remaining negatives are device-side
    /// failures.
    pub fn status(&self) -> i32 {
        match self {
            Error::UnsupportedDimPair { .. } => -1,
            Error::ShapeMismatch { .. } => -2,
            Error::AllocFailed { .. } => -3,
            Error::CopyFailed { .. } => -4,
            Error::KernelFault(_) => -5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_distinct_and_negative() {
        let errs = [
            Error::UnsupportedDimPair {
                dim_point: 4,
                dim_vect: 5,
            },
            Error::ShapeMismatch {
                what: "x",
                expected: 6,
                got: 5,
            },
            Error::AllocFailed { bytes: 64 },
            Error::CopyFailed {
                what: "out",
                expected: 3,
                got: 2,
            },
            Error::KernelFault("boom".into()),
        ];
        let codes: Vec<i32> = errs.iter().map(Error::status).collect();
        assert!(codes.iter().all(|&c| c < 0));
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(codes[0], -1);
    }
}
