//! Device buffer manager and scoped buffer handles
//!
//! Every allocation is returned as a [`ScopedBuffer`] that releases its
//! device memory when dropped, so buffers are freed on success, on a per-file
//! error and when the context is torn down, without explicit cleanup code.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::backend::{GpuBackend, GpuBuffer, HeapKind, ResourceState};
use crate::fence::FenceValue;
use crate::{Error, Result};

/// Largest single buffer the manager will request
pub const MAX_BUFFER_SIZE: u64 = 1 << 40;

/// Allocation counters shared between the manager and its buffers
#[derive(Debug, Default)]
struct Counters {
    allocations: AtomicU64,
    releases: AtomicU64,
    failures: AtomicU64,
    live_bytes: AtomicU64,
    peak_bytes: AtomicU64,
}

/// Snapshot of buffer manager statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Successful allocations
    pub allocations: u64,
    /// Buffers released
    pub releases: u64,
    /// Allocation requests that failed, including invalid sizes
    pub failures: u64,
    /// Bytes held by live buffers
    pub live_bytes: u64,
    /// Highest value `live_bytes` reached
    pub peak_bytes: u64,
}

impl BufferStats {
    /// Buffers currently alive
    pub fn live_buffers(&self) -> u64 {
        self.allocations - self.releases
    }
}

/// Allocates device buffers and tracks their lifetime
#[derive(Debug, Clone, Default)]
pub struct BufferManager {
    counters: Arc<Counters>,
}

impl BufferManager {
    /// Create a manager with zeroed statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a buffer of `size` bytes from `heap`
    ///
    /// # Errors
    /// `InvalidBufferSize` for a zero or oversized request, otherwise whatever
    /// the backend reports (typically `OutOfMemory`).
    pub fn allocate<B: GpuBackend>(
        &self,
        backend: &B,
        size: u64,
        heap: HeapKind,
    ) -> Result<ScopedBuffer<B::Buffer>> {
        if size == 0 || size > MAX_BUFFER_SIZE {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            return Err(Error::InvalidBufferSize {
                requested: size,
                maximum: MAX_BUFFER_SIZE,
            });
        }

        let inner = match backend.create_buffer(size, heap) {
            Ok(inner) => inner,
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };

        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        let live = self.counters.live_bytes.fetch_add(size, Ordering::Relaxed) + size;
        self.counters.peak_bytes.fetch_max(live, Ordering::Relaxed);
        trace!("Allocated {} byte {} buffer", size, heap);

        Ok(ScopedBuffer {
            inner,
            size,
            heap,
            state: ResourceState::CopyDestination,
            pending_fence: None,
            counters: self.counters.clone(),
        })
    }

    /// Current statistics
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            allocations: self.counters.allocations.load(Ordering::Relaxed),
            releases: self.counters.releases.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            live_bytes: self.counters.live_bytes.load(Ordering::Relaxed),
            peak_bytes: self.counters.peak_bytes.load(Ordering::Relaxed),
        }
    }
}

/// A device buffer released on drop
///
/// Tracks the residency state the host has recorded for the buffer and the
/// fence value that must complete before the contents may be read.
pub struct ScopedBuffer<T: GpuBuffer> {
    inner: T,
    size: u64,
    heap: HeapKind,
    state: ResourceState,
    pending_fence: Option<FenceValue>,
    counters: Arc<Counters>,
}

impl<T: GpuBuffer> ScopedBuffer<T> {
    /// Size in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Heap the buffer was allocated from
    #[inline]
    pub fn heap(&self) -> HeapKind {
        self.heap
    }

    /// Recorded residency state
    #[inline]
    pub fn state(&self) -> ResourceState {
        self.state
    }

    /// Backend buffer
    #[inline]
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Fence value that guards the buffer contents, if any
    #[inline]
    pub fn pending_fence(&self) -> Option<FenceValue> {
        self.pending_fence
    }

    /// Fail unless the buffer is in `expected` state
    pub fn expect_state(&self, expected: ResourceState) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    pub(crate) fn set_state(&mut self, state: ResourceState) {
        self.state = state;
    }

    pub(crate) fn set_pending_fence(&mut self, value: FenceValue) {
        self.pending_fence = Some(value);
    }
}

impl<T: GpuBuffer> Drop for ScopedBuffer<T> {
    fn drop(&mut self) {
        self.counters.releases.fetch_add(1, Ordering::Relaxed);
        self.counters.live_bytes.fetch_sub(self.size, Ordering::Relaxed);
        trace!("Released {} byte {} buffer ({})", self.size, self.heap, self.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::QueueDesc;
    use crate::backends::sim::{SimConfig, SimDevice};

    fn device() -> SimDevice {
        SimDevice::initialize(&SimConfig::default(), &QueueDesc::default()).unwrap()
    }

    #[test]
    fn test_allocate_tracks_lifetime() {
        let device = device();
        let manager = BufferManager::new();

        {
            let buffer = manager.allocate(&device, 4096, HeapKind::Default).unwrap();
            assert_eq!(buffer.size(), 4096);
            assert_eq!(buffer.heap(), HeapKind::Default);
            assert_eq!(buffer.state(), ResourceState::CopyDestination);
            assert_eq!(manager.stats().live_bytes, 4096);
            assert_eq!(manager.stats().live_buffers(), 1);
        }

        let stats = manager.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.releases, 1);
        assert_eq!(stats.live_bytes, 0);
        assert_eq!(stats.peak_bytes, 4096);
    }

    #[test]
    fn test_zero_size_rejected() {
        let device = device();
        let manager = BufferManager::new();

        let err = manager.allocate(&device, 0, HeapKind::Readback).err().unwrap();
        assert!(matches!(err, Error::InvalidBufferSize { requested: 0, .. }));
        assert_eq!(manager.stats().failures, 1);
        assert_eq!(manager.stats().allocations, 0);
    }

    #[test]
    fn test_out_of_memory_counted() {
        let config = SimConfig {
            memory_limit: 1024,
            ..Default::default()
        };
        let device = SimDevice::initialize(&config, &QueueDesc::default()).unwrap();
        let manager = BufferManager::new();

        let _held = manager.allocate(&device, 1000, HeapKind::Default).unwrap();
        let err = manager.allocate(&device, 100, HeapKind::Readback).err().unwrap();
        assert!(matches!(err, Error::OutOfMemory { size: 100, available: 24, .. }));
        assert_eq!(manager.stats().failures, 1);
    }

    #[test]
    fn test_expect_state() {
        let device = device();
        let manager = BufferManager::new();
        let mut buffer = manager.allocate(&device, 16, HeapKind::Default).unwrap();

        assert!(buffer.expect_state(ResourceState::CopyDestination).is_ok());
        buffer.set_state(ResourceState::CopySource);
        let err = buffer.expect_state(ResourceState::CopyDestination).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                expected: ResourceState::CopyDestination,
                actual: ResourceState::CopySource,
            }
        ));
    }
}
