//! GPU-direct ingestion primitives for gdscan
//!
//! This crate moves file contents into device memory and back out through a
//! host-mappable readback buffer:
//! - Device context owning the device, command queue, allocator and list
//! - Bulk read queue that lands file regions directly in device buffers
//! - Buffer manager with default (device) and readback (host visible) heaps
//! - Copy/transition pipeline recording onto the reusable command list
//! - Fences for explicit CPU/GPU synchronization
//!
//! # Architecture
//!
//! The design follows these principles:
//! 1. **Scoped buffers**: every allocation is released on drop, on every exit path
//! 2. **Explicit synchronization**: reads end with a queue idle wait, copies
//!    with a fence wait; mapping before the fence is rejected
//! 3. **Bounded waits**: every blocking wait carries a timeout
//! 4. **Explicit context**: no process-global device state
//!
//! # Example
//!
//! ```no_run
//! use gdscan_gpu::{ContextConfig, DeviceContext, HeapKind, SimConfig, SimDevice};
//!
//! # fn main() -> Result<(), gdscan_gpu::Error> {
//! let mut ctx = DeviceContext::<SimDevice>::new(ContextConfig::default());
//! ctx.initialize(&SimConfig::default())?;
//!
//! let mut gpu = ctx.allocate(5, HeapKind::Default)?;
//! {
//!     let mut queue = ctx.read_queue()?;
//!     let mut file = queue.open(std::path::Path::new("hello.txt"))?;
//!     queue.enqueue_read(&mut file, 0, 5, &gpu)?;
//!     queue.submit()?;
//!     queue.wait_idle()?;
//! }
//!
//! let mut readback = ctx.allocate(5, HeapKind::Readback)?;
//! {
//!     let mut pipeline = ctx.copy_pipeline()?;
//!     pipeline.copy(&mut gpu, &mut readback)?;
//!     let fence = pipeline.submit()?;
//!     pipeline.wait(fence)?;
//! }
//!
//! let mut host = vec![0u8; 5];
//! ctx.map_readback(&mut readback, &mut host)?;
//! ctx.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod backends;
pub mod buffer;
pub mod context;
pub mod error;
pub mod fence;
pub mod pipeline;
pub mod queue;

pub use backend::{
    BackendType, DeviceInfo, GpuBackend, GpuBuffer, HeapKind, QueueDesc, QueuePriority,
    ResourceState,
};
pub use backends::{SimConfig, SimDevice, SimFault, SimStats};
pub use buffer::{BufferManager, BufferStats, ScopedBuffer, MAX_BUFFER_SIZE};
pub use context::{ContextConfig, DeviceContext};
pub use error::{Error, ErrorKind, Result};
pub use fence::{Fence, FenceValue};
pub use pipeline::CopyPipeline;
pub use queue::{BulkReadQueue, ReadCounters, StorageFile};

#[cfg(feature = "cuda")]
pub use backends::{CudaBackend, CudaConfig};
