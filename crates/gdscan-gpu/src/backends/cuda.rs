//! CUDA backend implementation
//!
//! Maps the ingestion capability set onto cudarc:
//! - default heap buffers are device allocations (`CudaSlice<u8>`)
//! - readback heap buffers are page-locked host allocations, reachable by
//!   device DMA and directly readable once the copy has retired
//! - the bulk read queue is a dedicated stream fed from pinned staging
//!   buffers; idle waits are bounded polls on a recorded event
//! - the command queue is a second stream and fence values are events
//!   recorded on it

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cudarc::driver::{CudaContext, CudaEvent, CudaSlice, CudaStream, PinnedHostSlice};
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::backend::{
    BackendType, DeviceInfo, GpuBackend, GpuBuffer, HeapKind, QueueDesc, ResourceState,
};
use crate::{Error, Result};

/// Interval between event polls while waiting
const POLL_INTERVAL: Duration = Duration::from_micros(200);

/// CUDA backend configuration
#[derive(Debug, Clone, Default)]
pub struct CudaConfig {
    /// Device ordinal
    pub device_id: usize,
}

enum Memory {
    Device(CudaSlice<u8>),
    Pinned(PinnedHostSlice<u8>),
}

/// CUDA buffer: device memory for the default heap, pinned host memory for
/// the readback heap
pub struct CudaBuffer {
    memory: Arc<Mutex<Memory>>,
    heap: HeapKind,
    size: u64,
}

// SAFETY: the buffer is only touched through its mutex, and CUDA allocations
// are valid from any thread bound to the owning context.
unsafe impl Send for CudaBuffer {}

impl GpuBuffer for CudaBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn heap(&self) -> HeapKind {
        self.heap
    }
}

/// File opened for bulk reads
pub struct CudaFile {
    path: PathBuf,
    file: File,
}

struct ReadJob {
    path: PathBuf,
    file: File,
    offset: u64,
    length: usize,
    dst: Arc<Mutex<Memory>>,
}

enum Command {
    Transition,
    Copy {
        src: Arc<Mutex<Memory>>,
        dst: Arc<Mutex<Memory>>,
    },
}

/// CUDA GPU-direct backend
pub struct CudaBackend {
    // Fields drop in declaration order: staging, commands and streams go
    // before the context.
    staging: Vec<PinnedHostSlice<u8>>,
    pending_reads: Vec<ReadJob>,
    command_list: Vec<Command>,
    fences: Mutex<VecDeque<(u64, CudaEvent)>>,
    completed: Mutex<u64>,
    read_stream: Arc<CudaStream>,
    copy_stream: Arc<CudaStream>,
    ctx: Arc<CudaContext>,
    info: DeviceInfo,
}

// SAFETY: all CUDA handles are bound to `ctx`, which is rebound to the
// calling thread before use; mutation goes through `&mut self` or mutexes.
unsafe impl Send for CudaBackend {}

impl CudaBackend {
    /// Check if CUDA is available on this system
    pub fn is_available() -> bool {
        CudaContext::new(0).is_ok()
    }

    fn bind(&self) -> Result<()> {
        self.ctx.bind_to_thread()?;
        Ok(())
    }

    fn poll_event(event: &CudaEvent, timeout: Duration, operation: &'static str) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while !event.is_complete() {
            if Instant::now() >= deadline {
                return Err(Error::timeout(operation, timeout));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }

    fn stage_read(&mut self, job: ReadJob) -> Result<()> {
        // SAFETY: the staging slice is fully written by read_exact before
        // the transfer is enqueued.
        let mut staging = unsafe { self.ctx.alloc_pinned::<u8>(job.length) }?;

        {
            let bytes = staging.as_mut_slice()?;
            let mut file = job.file;
            file.seek(SeekFrom::Start(job.offset))
                .and_then(|_| file.read_exact(bytes))
                .map_err(|e| Error::Execution(format!("read of {} failed: {}", job.path.display(), e)))?;
        }

        let mut dst = job.dst.lock();
        match &mut *dst {
            Memory::Device(slice) => self.read_stream.memcpy_htod(&staging, slice)?,
            Memory::Pinned(_) => {
                return Err(Error::InvalidParameter("bulk reads target device memory".into()));
            }
        }
        drop(dst);

        self.staging.push(staging);
        Ok(())
    }
}

impl GpuBackend for CudaBackend {
    type Buffer = CudaBuffer;
    type File = CudaFile;
    type Config = CudaConfig;

    fn initialize(config: &CudaConfig, queue: &QueueDesc) -> Result<Self> {
        debug!("Initializing CUDA backend on device {}", config.device_id);

        let ctx = CudaContext::new(config.device_id).map_err(|e| {
            Error::Initialization(format!("device {}: {:?}", config.device_id, e))
        })?;
        let copy_stream = ctx
            .new_stream()
            .map_err(|e| Error::Initialization(format!("command queue: {:?}", e)))?;
        let read_stream = ctx
            .new_stream()
            .map_err(|e| Error::Initialization(format!("bulk read queue: {:?}", e)))?;

        let name = ctx
            .name()
            .map_err(|e| Error::Initialization(format!("device name: {:?}", e)))?;
        let (_, total) = cudarc::driver::result::mem_get_info()
            .map_err(|e| Error::Initialization(format!("memory query: {:?}", e)))?;

        info!("CUDA device initialized: {} ({:?} priority queues)", name, queue.priority);

        Ok(Self {
            staging: Vec::new(),
            pending_reads: Vec::new(),
            command_list: Vec::new(),
            fences: Mutex::new(VecDeque::new()),
            completed: Mutex::new(0),
            read_stream,
            copy_stream,
            ctx,
            info: DeviceInfo {
                name,
                backend: BackendType::Cuda,
                ordinal: config.device_id,
                total_memory: total as u64,
            },
        })
    }

    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn available_memory(&self) -> u64 {
        if self.bind().is_err() {
            return 0;
        }
        cudarc::driver::result::mem_get_info()
            .map(|(free, _)| free as u64)
            .unwrap_or(0)
    }

    fn create_buffer(&self, size: u64, heap: HeapKind) -> Result<CudaBuffer> {
        self.bind()?;
        let len = usize::try_from(size).map_err(|_| Error::InvalidBufferSize {
            requested: size,
            maximum: usize::MAX as u64,
        })?;

        let memory = match heap {
            HeapKind::Default => self
                .copy_stream
                .alloc_zeros::<u8>(len)
                .map(Memory::Device),
            // SAFETY: readback memory is only read after a device copy has
            // filled it and its fence has been observed.
            HeapKind::Readback => unsafe { self.ctx.alloc_pinned::<u8>(len) }.map(Memory::Pinned),
        }
        .map_err(|_| Error::out_of_memory(heap, size, self.available_memory()))?;

        Ok(CudaBuffer {
            memory: Arc::new(Mutex::new(memory)),
            heap,
            size,
        })
    }

    fn open_file(&self, path: &Path) -> Result<CudaFile> {
        let file = File::open(path).map_err(|e| Error::file_open(path, e))?;
        if file.metadata().map(|m| m.is_dir()).unwrap_or(false) {
            return Err(Error::file_open(path, "is a directory"));
        }
        Ok(CudaFile {
            path: path.to_path_buf(),
            file,
        })
    }

    fn file_size(&self, file: &CudaFile) -> Result<u64> {
        file.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| Error::metadata(&file.path, e))
    }

    fn enqueue_read(&mut self, file: &CudaFile, offset: u64, length: u64, dst: &CudaBuffer) -> Result<()> {
        let handle = file
            .file
            .try_clone()
            .map_err(|e| Error::Execution(format!("failed to duplicate handle: {}", e)))?;
        self.pending_reads.push(ReadJob {
            path: file.path.clone(),
            file: handle,
            offset,
            length: length as usize,
            dst: dst.memory.clone(),
        });
        Ok(())
    }

    fn submit_reads(&mut self) -> Result<()> {
        self.bind()?;
        let jobs = std::mem::take(&mut self.pending_reads);
        let count = jobs.len();
        for job in jobs {
            self.stage_read(job)?;
        }
        trace!("Submitted {} reads to the transfer stream", count);
        Ok(())
    }

    fn wait_reads_idle(&mut self, timeout: Duration) -> Result<()> {
        self.bind()?;
        let event = self.read_stream.record_event(None)?;
        Self::poll_event(&event, timeout, "bulk read queue idle")?;
        self.staging.clear();
        Ok(())
    }

    fn record_transition(&mut self, _buffer: &CudaBuffer, before: ResourceState, after: ResourceState) -> Result<()> {
        // Stream order already serializes the read and the copy; the
        // transition only has to be validated.
        if before == after {
            return Err(Error::InvalidParameter("no-op transition".into()));
        }
        self.command_list.push(Command::Transition);
        Ok(())
    }

    fn record_copy(&mut self, src: &CudaBuffer, dst: &CudaBuffer) -> Result<()> {
        if Arc::ptr_eq(&src.memory, &dst.memory) {
            return Err(Error::InvalidParameter("copy source and destination alias".into()));
        }
        if src.size != dst.size {
            return Err(Error::InvalidParameter(format!(
                "copy of {} bytes into {} byte buffer",
                src.size, dst.size
            )));
        }
        self.command_list.push(Command::Copy {
            src: src.memory.clone(),
            dst: dst.memory.clone(),
        });
        Ok(())
    }

    fn execute_command_list(&mut self) -> Result<()> {
        self.bind()?;
        let commands = std::mem::take(&mut self.command_list);
        for command in commands {
            let Command::Copy { src, dst } = command else {
                continue;
            };
            let src = src.lock();
            let mut dst = dst.lock();
            match (&*src, &mut *dst) {
                (Memory::Device(s), Memory::Pinned(d)) => self.copy_stream.memcpy_dtoh(s, d)?,
                (Memory::Device(s), Memory::Device(d)) => self.copy_stream.memcpy_dtod(s, d)?,
                _ => {
                    return Err(Error::Execution("copy source must be device memory".into()));
                }
            }
        }
        Ok(())
    }

    fn signal_fence(&mut self, value: u64) -> Result<()> {
        self.bind()?;
        let event = self.copy_stream.record_event(None)?;
        self.fences.lock().push_back((value, event));
        Ok(())
    }

    fn completed_fence_value(&self) -> u64 {
        let mut fences = self.fences.lock();
        let mut completed = self.completed.lock();
        while let Some((value, event)) = fences.front() {
            if !event.is_complete() {
                break;
            }
            *completed = (*completed).max(*value);
            fences.pop_front();
        }
        *completed
    }

    fn wait_fence(&self, value: u64, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while self.completed_fence_value() < value {
            if Instant::now() >= deadline {
                return Err(Error::timeout("fence", timeout));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }

    fn read_mapped(&self, buffer: &CudaBuffer, dst: &mut [u8]) -> Result<()> {
        let memory = buffer.memory.lock();
        match &*memory {
            Memory::Pinned(pinned) => {
                let bytes = pinned.as_slice()?;
                dst.copy_from_slice(&bytes[..dst.len()]);
                Ok(())
            }
            Memory::Device(_) => Err(Error::InvalidParameter(
                "default heap buffers cannot be mapped".into(),
            )),
        }
    }

    fn validate(&self) -> Result<()> {
        self.bind()?;
        self.ctx.synchronize()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cuda_availability() {
        let available = CudaBackend::is_available();
        println!("CUDA available: {}", available);
    }

    #[test]
    fn test_cuda_buffers() {
        let Ok(device) = CudaBackend::initialize(&CudaConfig::default(), &QueueDesc::default()) else {
            return;
        };
        let buffer = device.create_buffer(4096, HeapKind::Default).unwrap();
        assert_eq!(buffer.size(), 4096);
        let readback = device.create_buffer(4096, HeapKind::Readback).unwrap();
        assert_eq!(readback.heap(), HeapKind::Readback);
    }
}
