//! Device context: the device, its queues and the reusable command list
//!
//! A context is an explicit object rather than process-global state, so any
//! number of independent sessions can coexist. The command list inside the
//! backend is mutated in place for every file, which is why every operation
//! that touches it takes `&mut self`.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::{DeviceInfo, GpuBackend, HeapKind, QueueDesc, ResourceState};
use crate::buffer::{BufferManager, ScopedBuffer};
use crate::fence::Fence;
use crate::pipeline::CopyPipeline;
use crate::queue::{BulkReadQueue, ReadCounters};
use crate::{Error, Result};

/// Context configuration
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Description used for both the command queue and the bulk read queue
    pub queue: QueueDesc,
    /// Upper bound for a bulk read queue idle wait
    pub idle_timeout: Duration,
    /// Upper bound for a fence wait
    pub fence_timeout: Duration,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            queue: QueueDesc::default(),
            idle_timeout: Duration::from_secs(30),
            fence_timeout: Duration::from_secs(10),
        }
    }
}

/// Owner of the device and everything created from it
pub struct DeviceContext<B: GpuBackend> {
    backend: Option<B>,
    buffers: BufferManager,
    fence: Fence,
    reads: ReadCounters,
    config: ContextConfig,
}

impl<B: GpuBackend> DeviceContext<B> {
    /// Create an uninitialized context
    pub fn new(config: ContextConfig) -> Self {
        Self {
            backend: None,
            buffers: BufferManager::new(),
            fence: Fence::new(),
            reads: ReadCounters::default(),
            config,
        }
    }

    /// Create the device, command queue, allocator, command list and bulk
    /// read queue.
    ///
    /// # Errors
    /// `Initialization` if any step fails or the context is already
    /// initialized. A failed call leaves the context uninitialized.
    pub fn initialize(&mut self, backend_config: &B::Config) -> Result<()> {
        if self.backend.is_some() {
            return Err(Error::Initialization("device context is already initialized".into()));
        }

        let backend = B::initialize(backend_config, &self.config.queue)?;
        info!(
            "Device context ready: {} ({}, {} bytes)",
            backend.device_info().name,
            backend.backend_type(),
            backend.device_info().total_memory
        );

        self.fence.reset();
        self.reads = ReadCounters::default();
        self.backend = Some(backend);
        Ok(())
    }

    /// Release the device and all queues. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        let Some(backend) = self.backend.take() else {
            debug!("Device context shutdown requested but not initialized");
            return;
        };

        let stats = self.buffers.stats();
        if stats.live_buffers() > 0 {
            warn!("Shutting down with {} live device buffers", stats.live_buffers());
        }
        if !self.reads.is_idle() {
            warn!("Shutting down with {:?} outstanding bulk reads", self.reads);
        }

        drop(backend);
        self.reads = ReadCounters::default();
        info!("Device context shut down");
    }

    /// Whether `initialize` has succeeded and `shutdown` has not been called
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.backend.is_some()
    }

    /// Context configuration
    #[inline]
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// The backend, if initialized
    pub fn backend(&self) -> Result<&B> {
        self.backend.as_ref().ok_or(Error::NotInitialized)
    }

    /// Device information
    pub fn device_info(&self) -> Result<&DeviceInfo> {
        Ok(self.backend()?.device_info())
    }

    /// Buffer manager and its statistics
    #[inline]
    pub fn buffers(&self) -> &BufferManager {
        &self.buffers
    }

    /// Allocate a scoped device buffer
    pub fn allocate(&self, size: u64, heap: HeapKind) -> Result<ScopedBuffer<B::Buffer>> {
        let backend = self.backend()?;
        self.buffers.allocate(backend, size, heap)
    }

    /// Borrow the bulk read queue
    pub fn read_queue(&mut self) -> Result<BulkReadQueue<'_, B>> {
        let backend = self.backend.as_mut().ok_or(Error::NotInitialized)?;
        Ok(BulkReadQueue::new(backend, &mut self.reads, self.config.idle_timeout))
    }

    /// Borrow the command list for copy recording
    pub fn copy_pipeline(&mut self) -> Result<CopyPipeline<'_, B>> {
        let backend = self.backend.as_mut().ok_or(Error::NotInitialized)?;
        Ok(CopyPipeline::new(
            backend,
            &mut self.fence,
            self.reads,
            self.config.fence_timeout,
        ))
    }

    /// Map a readback buffer and copy its contents into `dst`
    ///
    /// # Errors
    /// `Execution` if the copy that fills the buffer has not been observed
    /// complete on the fence; mapping earlier would read stale memory.
    pub fn map_readback(&self, buffer: &mut ScopedBuffer<B::Buffer>, dst: &mut [u8]) -> Result<()> {
        let backend = self.backend()?;

        if buffer.heap() != HeapKind::Readback {
            return Err(Error::InvalidParameter(format!(
                "only readback buffers are host mappable, got a {} buffer",
                buffer.heap()
            )));
        }
        if dst.len() as u64 != buffer.size() {
            return Err(Error::InvalidParameter(format!(
                "host buffer is {} bytes, readback buffer is {} bytes",
                dst.len(),
                buffer.size()
            )));
        }
        buffer.expect_state(ResourceState::CopyDestination)?;

        if let Some(value) = buffer.pending_fence() {
            if !self.fence.is_complete(backend, value) {
                return Err(Error::Execution(format!(
                    "readback buffer mapped before fence {} completed",
                    value
                )));
            }
        }

        buffer.set_state(ResourceState::Mapped);
        backend.read_mapped(buffer.inner(), dst)
    }

    /// Check that the device is still usable
    pub fn validate(&self) -> Result<()> {
        self.backend()?.validate()
    }
}

impl<B: GpuBackend> Drop for DeviceContext<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::sim::{SimConfig, SimDevice, SimFault};
    use std::io::Write;

    #[test]
    fn test_uninitialized_context() {
        let mut ctx = DeviceContext::<SimDevice>::new(ContextConfig::default());
        assert!(!ctx.is_initialized());
        assert!(matches!(ctx.allocate(16, HeapKind::Default), Err(Error::NotInitialized)));
        assert!(matches!(ctx.read_queue(), Err(Error::NotInitialized)));
        assert!(matches!(ctx.copy_pipeline(), Err(Error::NotInitialized)));
        assert!(matches!(ctx.validate(), Err(Error::NotInitialized)));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut ctx = DeviceContext::<SimDevice>::new(ContextConfig::default());
        ctx.shutdown();

        ctx.initialize(&SimConfig::default()).unwrap();
        assert!(ctx.is_initialized());
        ctx.shutdown();
        ctx.shutdown();
        assert!(!ctx.is_initialized());
        assert!(matches!(ctx.device_info(), Err(Error::NotInitialized)));
    }

    #[test]
    fn test_double_initialize_rejected() {
        let mut ctx = DeviceContext::<SimDevice>::new(ContextConfig::default());
        ctx.initialize(&SimConfig::default()).unwrap();
        let err = ctx.initialize(&SimConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Initialization(_)));
        assert!(ctx.is_initialized());
    }

    #[test]
    fn test_failed_initialize_leaves_nothing() {
        let mut ctx = DeviceContext::<SimDevice>::new(ContextConfig::default());
        let config = SimConfig {
            fault: Some(SimFault::FailInitialize),
            ..Default::default()
        };
        assert!(matches!(ctx.initialize(&config), Err(Error::Initialization(_))));
        assert!(!ctx.is_initialized());

        ctx.initialize(&SimConfig::default()).unwrap();
        assert!(ctx.is_initialized());
    }

    #[test]
    fn test_full_pipeline() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"direct to device").unwrap();
        file.flush().unwrap();

        let mut ctx = DeviceContext::<SimDevice>::new(ContextConfig::default());
        ctx.initialize(&SimConfig::default()).unwrap();

        let mut gpu = ctx.allocate(16, HeapKind::Default).unwrap();
        {
            let mut queue = ctx.read_queue().unwrap();
            let mut storage = queue.open(file.path()).unwrap();
            queue.enqueue_read(&mut storage, 0, 16, &gpu).unwrap();
            queue.submit().unwrap();
            queue.wait_idle().unwrap();
        }

        let mut readback = ctx.allocate(16, HeapKind::Readback).unwrap();
        {
            let mut pipeline = ctx.copy_pipeline().unwrap();
            pipeline.copy(&mut gpu, &mut readback).unwrap();
            let value = pipeline.submit().unwrap();
            pipeline.wait(value).unwrap();
        }

        let mut host = vec![0u8; 16];
        ctx.map_readback(&mut readback, &mut host).unwrap();
        assert_eq!(&host, b"direct to device");
        assert_eq!(readback.state(), ResourceState::Mapped);

        drop(gpu);
        drop(readback);
        assert_eq!(ctx.buffers().stats().live_buffers(), 0);
    }

    #[test]
    fn test_map_before_fence_rejected() {
        let config = SimConfig {
            exec_latency: Duration::from_millis(200),
            ..Default::default()
        };
        let mut ctx = DeviceContext::<SimDevice>::new(ContextConfig::default());
        ctx.initialize(&config).unwrap();

        let mut gpu = ctx.allocate(8, HeapKind::Default).unwrap();
        let mut readback = ctx.allocate(8, HeapKind::Readback).unwrap();
        let value = {
            let mut pipeline = ctx.copy_pipeline().unwrap();
            pipeline.copy(&mut gpu, &mut readback).unwrap();
            pipeline.submit().unwrap()
        };

        let mut host = vec![0u8; 8];
        let err = ctx.map_readback(&mut readback, &mut host).unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
        assert_eq!(readback.state(), ResourceState::CopyDestination);

        ctx.copy_pipeline().unwrap().wait(value).unwrap();
        ctx.map_readback(&mut readback, &mut host).unwrap();
    }

    #[test]
    fn test_map_default_heap_rejected() {
        let mut ctx = DeviceContext::<SimDevice>::new(ContextConfig::default());
        ctx.initialize(&SimConfig::default()).unwrap();

        let mut gpu = ctx.allocate(8, HeapKind::Default).unwrap();
        let mut host = vec![0u8; 8];
        assert!(matches!(
            ctx.map_readback(&mut gpu, &mut host),
            Err(Error::InvalidParameter(_))
        ));
    }
}
