//! Simulated device heap.
//!
//! The engine owns its buffers for exactly one evaluation: allocate, copy
//! in, reduce, copy out, free. Modelling that lifecycle through an explicit
//! [`Device`] keeps the ownership contract checkable — the live counters
//! must read zero after every call, successful or not — and gives the tests
//! a hook to fail any single allocation on purpose.
//!
//! Buffers release through `Drop`, so every early-return path in the launch
//! wrapper frees whatever was already allocated without cleanup code.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::scalar::Scalar;

/// Allocation arena with live-buffer accounting and fault injection.
pub struct Device {
    live_buffers: AtomicUsize,
    live_bytes: AtomicUsize,
    fault: Mutex<FaultPlan>,
}

#[derive(Default)]
struct FaultPlan {
    /// Countdown to the next injected allocation failure; `None` disables.
    fail_alloc_after: Option<usize>,
}

impl Device {
    pub fn new() -> Self {
        Self {
            live_buffers: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
            fault: Mutex::new(FaultPlan::default()),
        }
    }

    /// Allocate a buffer of `len` scalars.
    pub fn alloc<T: Scalar>(&self, len: usize) -> Result<DeviceBuffer<'_, T>> {
        let bytes = len * std::mem::size_of::<T>();
        if self.take_alloc_fault() {
            return Err(Error::AllocFailed { bytes });
        }
        self.live_buffers.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
        Ok(DeviceBuffer {
            data: vec![T::ZERO; len],
            bytes,
            device: self,
        })
    }

    fn take_alloc_fault(&self) -> bool {
        let mut plan = self.fault.lock();
        match plan.fail_alloc_after.as_mut() {
            Some(0) => {
                plan.fail_alloc_after = None;
                true
            }
            Some(n) => {
                *n -= 1;
                false
            }
            None => false,
        }
    }

    /// Make the (n+1)-th allocation from now fail. Test hook; one-shot.
    pub fn fail_alloc_after(&self, n: usize) {
        self.fault.lock().fail_alloc_after = Some(n);
    }

    /// Number of buffers currently alive.
    pub fn live_buffers(&self) -> usize {
        self.live_buffers.load(Ordering::Relaxed)
    }

    /// Bytes currently resident.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

/// A buffer owned by one evaluation. Frees itself on drop.
pub struct DeviceBuffer<'d, T: Scalar> {
    data: Vec<T>,
    bytes: usize,
    device: &'d Device,
}

impl<T: Scalar> DeviceBuffer<'_, T> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Host -> device transfer. Lengths must match exactly; the buffer is
    /// never partially written.
    pub fn copy_from_host(&mut self, src: &[T], what: &'static str) -> Result<()> {
        if src.len() != self.data.len() {
            return Err(Error::CopyFailed {
                what,
                expected: self.data.len(),
                got: src.len(),
            });
        }
        self.data.copy_from_slice(src);
        Ok(())
    }

    /// Device -> host transfer.
    pub fn copy_to_host(&self, dst: &mut [T], what: &'static str) -> Result<()> {
        if dst.len() != self.data.len() {
            return Err(Error::CopyFailed {
                what,
                expected: self.data.len(),
                got: dst.len(),
            });
        }
        dst.copy_from_slice(&self.data);
        Ok(())
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T: Scalar> Drop for DeviceBuffer<'_, T> {
    fn drop(&mut self) {
        self.device.live_buffers.fetch_sub(1, Ordering::Relaxed);
        self.device.live_bytes.fetch_sub(self.bytes, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_track_alloc_and_drop() {
        let dev = Device::new();
        assert_eq!(dev.live_buffers(), 0);
        {
            let _a = dev.alloc::<f32>(100).unwrap();
            let _b = dev.alloc::<f64>(10).unwrap();
            assert_eq!(dev.live_buffers(), 2);
            assert_eq!(dev.live_bytes(), 100 * 4 + 10 * 8);
        }
        assert_eq!(dev.live_buffers(), 0);
        assert_eq!(dev.live_bytes(), 0);
    }

    #[test]
    fn test_injected_fault_hits_the_requested_allocation() {
        let dev = Device::new();
        dev.fail_alloc_after(1);
        let first = dev.alloc::<f32>(8).unwrap();
        let second = dev.alloc::<f32>(8);
        assert!(matches!(second, Err(Error::AllocFailed { .. })));
        // The plan is one-shot.
        let third = dev.alloc::<f32>(8).unwrap();
        drop(first);
        drop(third);
        assert_eq!(dev.live_buffers(), 0);
    }

    #[test]
    fn test_copy_length_mismatch_is_an_error() {
        let dev = Device::new();
        let mut buf = dev.alloc::<f32>(4).unwrap();
        let err = buf.copy_from_host(&[1.0; 3], "x").unwrap_err();
        assert!(matches!(err, Error::CopyFailed { what: "x", .. }));
        assert_eq!(err.status(), -4);

        buf.copy_from_host(&[1.0, 2.0, 3.0, 4.0], "x").unwrap();
        let mut out = vec![0.0f32; 4];
        buf.copy_to_host(&mut out, "x").unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
    }
}
