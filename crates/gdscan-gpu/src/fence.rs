//! Fence values for CPU/GPU synchronization
//!
//! A fence is a counter the device advances as it retires work. The host
//! signals a fresh value behind submitted work and blocks until the device
//! reports that value (or a later one) as completed.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::backend::GpuBackend;
use crate::Result;

/// A value on the fence timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FenceValue(pub u64);

impl fmt::Display for FenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Host-side view of a device fence
#[derive(Debug, Default)]
pub struct Fence {
    last_signaled: u64,
}

impl Fence {
    /// Create a fence with no signaled values
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value handed to the device
    #[inline]
    pub fn last_signaled(&self) -> FenceValue {
        FenceValue(self.last_signaled)
    }

    /// The value the next call to [`Fence::signal`] will use
    #[inline]
    pub fn next_value(&self) -> FenceValue {
        FenceValue(self.last_signaled + 1)
    }

    /// Signal the next value behind all work executed so far
    pub fn signal<B: GpuBackend>(&mut self, backend: &mut B) -> Result<FenceValue> {
        let value = self.next_value();
        backend.signal_fence(value.0)?;
        self.last_signaled = value.0;
        trace!("Fence signaled {}", value);
        Ok(value)
    }

    /// Check whether the device has reached `value`
    pub fn is_complete<B: GpuBackend>(&self, backend: &B, value: FenceValue) -> bool {
        backend.completed_fence_value() >= value.0
    }

    /// Block until the device reaches `value`
    ///
    /// # Errors
    /// `Timeout` if the value is not reached within `timeout`.
    pub fn wait<B: GpuBackend>(&self, backend: &B, value: FenceValue, timeout: Duration) -> Result<()> {
        if self.is_complete(backend, value) {
            return Ok(());
        }

        let start = Instant::now();
        backend.wait_fence(value.0, timeout)?;
        debug!("Fence {} reached after {:?}", value, start.elapsed());
        Ok(())
    }

    /// Restart the timeline, used when the device is recreated
    pub(crate) fn reset(&mut self) {
        self.last_signaled = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::QueueDesc;
    use crate::backends::sim::{SimConfig, SimDevice, SimFault};
    use crate::Error;

    #[test]
    fn test_signal_is_monotonic() {
        let mut device = SimDevice::initialize(&SimConfig::default(), &QueueDesc::default()).unwrap();
        let mut fence = Fence::new();

        let first = fence.signal(&mut device).unwrap();
        let second = fence.signal(&mut device).unwrap();
        assert!(second > first);
        assert_eq!(fence.last_signaled(), second);
        assert_eq!(fence.next_value(), FenceValue(3));

        fence.wait(&device, second, Duration::from_secs(5)).unwrap();
        assert!(fence.is_complete(&device, first));
        assert!(fence.is_complete(&device, second));
    }

    #[test]
    fn test_wait_times_out_on_stalled_queue() {
        let config = SimConfig {
            fault: Some(SimFault::StallCommandQueue),
            ..Default::default()
        };
        let mut device = SimDevice::initialize(&config, &QueueDesc::default()).unwrap();
        let mut fence = Fence::new();

        let value = fence.signal(&mut device).unwrap();
        let err = fence
            .wait(&device, value, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(!fence.is_complete(&device, value));
    }
}
