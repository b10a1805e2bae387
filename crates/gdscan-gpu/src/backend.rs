//! Backend abstraction for GPU-direct ingestion
//!
//! A backend bundles the capability set the ingestion pipeline drives:
//! device setup, a bulk read queue that lands file bytes in device memory,
//! a buffer allocator with two heaps, a recordable command list with
//! transition and copy commands, a monotonically increasing fence, and
//! host mapping of readback buffers.
//!
//! Higher level wrappers (`DeviceContext`, `BulkReadQueue`, `BufferManager`,
//! `CopyPipeline`) layer state tracking and logging on top; backends only
//! have to do the device work.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Supported backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// In-process simulated device
    Sim,
    /// NVIDIA CUDA
    Cuda,
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendType::Sim => write!(f, "sim"),
            BackendType::Cuda => write!(f, "cuda"),
        }
    }
}

/// Device information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device name
    pub name: String,
    /// Backend that owns the device
    pub backend: BackendType,
    /// Device ordinal
    pub ordinal: usize,
    /// Total device memory in bytes
    pub total_memory: u64,
}

/// Memory heap a buffer is allocated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeapKind {
    /// Device-local memory, target of bulk reads. Not host addressable.
    Default,
    /// Host-mappable memory, target of device-to-device copies.
    Readback,
}

impl fmt::Display for HeapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapKind::Default => write!(f, "default"),
            HeapKind::Readback => write!(f, "readback"),
        }
    }
}

/// Residency state of a device buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceState {
    /// Writable by reads and copies
    CopyDestination,
    /// Readable as the source of a copy
    CopySource,
    /// Mapped into host memory
    Mapped,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceState::CopyDestination => write!(f, "CopyDestination"),
            ResourceState::CopySource => write!(f, "CopySource"),
            ResourceState::Mapped => write!(f, "Mapped"),
        }
    }
}

/// Command queue priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePriority {
    /// Background work
    Low,
    /// Default priority
    #[default]
    Normal,
    /// Latency sensitive work
    High,
}

/// Queue description shared by the command queue and the bulk read queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDesc {
    /// Scheduling priority
    pub priority: QueuePriority,
    /// Device ordinal the queues are created on
    pub ordinal: usize,
}

impl Default for QueueDesc {
    fn default() -> Self {
        Self {
            priority: QueuePriority::Normal,
            ordinal: 0,
        }
    }
}

/// Device buffer handle
///
/// Dropping the handle releases the device memory.
pub trait GpuBuffer: Send {
    /// Size of the buffer in bytes
    fn size(&self) -> u64;

    /// Heap the buffer lives in
    fn heap(&self) -> HeapKind;
}

/// GPU-direct ingestion backend
///
/// Methods taking `&mut self` mutate queue or command list state and must be
/// externally serialized; `DeviceContext` does this by requiring exclusive
/// access.
pub trait GpuBackend: Send + Sized {
    /// Device buffer type
    type Buffer: GpuBuffer;
    /// Open file handle type
    type File: Send;
    /// Backend specific configuration
    type Config: Clone + Send;

    /// Create the device, command queue, command allocator, command list
    /// and bulk read queue.
    ///
    /// Either every object is created or an error is returned and nothing
    /// is left behind.
    fn initialize(config: &Self::Config, queue: &QueueDesc) -> Result<Self>;

    /// Device information
    fn device_info(&self) -> &DeviceInfo;

    /// Backend type
    fn backend_type(&self) -> BackendType {
        self.device_info().backend
    }

    /// Bytes currently available for allocation
    fn available_memory(&self) -> u64;

    /// Allocate a buffer of `size` bytes in the given heap.
    ///
    /// The buffer starts in `CopyDestination` state. `size` is never zero.
    fn create_buffer(&self, size: u64, heap: HeapKind) -> Result<Self::Buffer>;

    /// Open a file for bulk reads
    fn open_file(&self, path: &Path) -> Result<Self::File>;

    /// Size of an open file in bytes
    fn file_size(&self, file: &Self::File) -> Result<u64>;

    /// Register a read of `length` bytes at `offset` into the start of `dst`.
    ///
    /// Does not block and does not start the transfer.
    fn enqueue_read(
        &mut self,
        file: &Self::File,
        offset: u64,
        length: u64,
        dst: &Self::Buffer,
    ) -> Result<()>;

    /// Hand every enqueued read to the transfer engine
    fn submit_reads(&mut self) -> Result<()>;

    /// Block until every submitted read has finished
    fn wait_reads_idle(&mut self, timeout: Duration) -> Result<()>;

    /// Record a resource state transition on the command list
    fn record_transition(
        &mut self,
        buffer: &Self::Buffer,
        before: ResourceState,
        after: ResourceState,
    ) -> Result<()>;

    /// Record a full-buffer copy on the command list
    fn record_copy(&mut self, src: &Self::Buffer, dst: &Self::Buffer) -> Result<()>;

    /// Close and execute the command list, then reset it for reuse.
    ///
    /// Does not wait for the work to finish.
    fn execute_command_list(&mut self) -> Result<()>;

    /// Enqueue a fence signal of `value` behind all executed work
    fn signal_fence(&mut self, value: u64) -> Result<()>;

    /// Highest fence value the device has reached
    fn completed_fence_value(&self) -> u64;

    /// Block until the fence reaches `value`
    fn wait_fence(&self, value: u64, timeout: Duration) -> Result<()>;

    /// Map a readback buffer, copy `dst.len()` bytes out of it, unmap.
    fn read_mapped(&self, buffer: &Self::Buffer, dst: &mut [u8]) -> Result<()>;

    /// Check that the device and its queues are still usable
    fn validate(&self) -> Result<()>;
}
