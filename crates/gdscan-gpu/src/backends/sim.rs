//! Simulated device backend
//!
//! Device memory is ordinary process memory, but the transfer engine and the
//! command queue each run on a worker thread, so submissions complete
//! asynchronously exactly like on real hardware: touching a buffer before
//! the matching idle wait or fence wait observes stale bytes.
//!
//! The backend is selected explicitly (tests, demos, CI machines). It also
//! supports fault injection through [`SimFault`].

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::backend::{
    BackendType, DeviceInfo, GpuBackend, GpuBuffer, HeapKind, QueueDesc, ResourceState,
};
use crate::{Error, Result};

type Storage = Arc<Mutex<Vec<u8>>>;

/// Injectable device failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    /// Device creation fails
    FailInitialize,
    /// Every command list execution is rejected
    RejectSubmissions,
    /// The command queue accepts work but never retires it
    StallCommandQueue,
    /// The transfer engine accepts reads but never completes them
    StallReads,
    /// The first command list execution removes the device
    LoseDevice,
}

/// Simulated device configuration
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Reported device name
    pub name: String,
    /// Bytes of device memory shared by both heaps
    pub memory_limit: u64,
    /// Delay applied to every bulk read
    pub read_latency: Duration,
    /// Delay applied to every executed command list
    pub exec_latency: Duration,
    /// Injected failure
    pub fault: Option<SimFault>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            name: "gdscan simulated device".into(),
            memory_limit: 4 * 1024 * 1024 * 1024,
            read_latency: Duration::ZERO,
            exec_latency: Duration::ZERO,
            fault: None,
        }
    }
}

/// Counters exposed for diagnostics and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Reads handed to the transfer engine
    pub reads_submitted: u64,
    /// Reads the transfer engine finished
    pub reads_completed: u64,
    /// Command lists executed
    pub lists_executed: u64,
}

#[derive(Debug)]
struct MemoryPool {
    limit: u64,
    used: Mutex<u64>,
}

impl MemoryPool {
    fn reserve(&self, heap: HeapKind, size: u64) -> Result<()> {
        let mut used = self.used.lock();
        let available = self.limit.saturating_sub(*used);
        if size > available {
            return Err(Error::out_of_memory(heap, size, available));
        }
        *used += size;
        Ok(())
    }

    fn release(&self, size: u64) {
        let mut used = self.used.lock();
        *used = used.saturating_sub(size);
    }

    fn available(&self) -> u64 {
        self.limit.saturating_sub(*self.used.lock())
    }
}

/// Bytes held in the pool until every owner is gone
#[derive(Debug)]
struct Reservation {
    size: u64,
    memory: Arc<MemoryPool>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.memory.release(self.size);
    }
}

/// Buffer in simulated device memory
///
/// Reads in flight share the buffer's reservation, so dropping the buffer
/// does not return its bytes to the pool until those reads retire.
pub struct SimBuffer {
    id: u64,
    heap: HeapKind,
    size: u64,
    data: Storage,
    reservation: Arc<Reservation>,
}

impl GpuBuffer for SimBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn heap(&self) -> HeapKind {
        self.heap
    }
}

/// File opened on the simulated transfer engine
pub struct SimFile {
    path: PathBuf,
    file: File,
}

struct ReadJob {
    path: PathBuf,
    file: File,
    offset: u64,
    length: u64,
    dst: Storage,
    _reservation: Arc<Reservation>,
}

#[derive(Default)]
struct ReadProgress {
    submitted: u64,
    completed: u64,
    errors: Vec<String>,
}

#[derive(Default)]
struct ReadEngine {
    progress: Mutex<ReadProgress>,
    idle: Condvar,
}

struct SimReadQueue {
    pending: Vec<ReadJob>,
    engine: Arc<ReadEngine>,
    sender: Option<Sender<ReadJob>>,
    worker: Option<JoinHandle<()>>,
}

impl SimReadQueue {
    fn spawn(latency: Duration, stall: bool) -> Result<Self> {
        let (sender, receiver) = unbounded::<ReadJob>();
        let engine = Arc::new(ReadEngine::default());
        let worker_engine = engine.clone();

        let worker = std::thread::Builder::new()
            .name("gdscan-sim-reads".into())
            .spawn(move || read_worker(receiver, worker_engine, latency, stall))
            .map_err(|e| Error::Initialization(format!("failed to start transfer engine: {}", e)))?;

        Ok(Self {
            pending: Vec::new(),
            engine,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    fn is_alive(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }
}

impl Drop for SimReadQueue {
    fn drop(&mut self) {
        self.pending.clear();
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn read_worker(receiver: Receiver<ReadJob>, engine: Arc<ReadEngine>, latency: Duration, stall: bool) {
    // stalled jobs never retire, they stay owned until the engine shuts down
    let mut stalled = Vec::new();
    for job in receiver {
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        if stall {
            trace!("Transfer engine stalled on {}", job.path.display());
            stalled.push(job);
            continue;
        }

        let result = run_read(job);
        let mut progress = engine.progress.lock();
        progress.completed += 1;
        if let Err(message) = result {
            progress.errors.push(message);
        }
        engine.idle.notify_all();
    }
}

fn run_read(mut job: ReadJob) -> std::result::Result<(), String> {
    let length = job.length as usize;
    job.file
        .seek(SeekFrom::Start(job.offset))
        .map_err(|e| format!("seek in {} failed: {}", job.path.display(), e))?;

    let mut data = job.dst.lock();
    job.file
        .read_exact(&mut data[..length])
        .map_err(|e| format!("read of {} bytes from {} failed: {}", length, job.path.display(), e))
}

enum Command {
    Transition {
        buffer: u64,
        before: ResourceState,
        after: ResourceState,
    },
    Copy {
        src: Storage,
        dst: Storage,
        size: usize,
    },
}

enum QueueOp {
    Execute(Vec<Command>),
    Signal(u64),
}

#[derive(Default)]
struct FenceState {
    completed: Mutex<u64>,
    reached: Condvar,
}

struct SimCommandQueue {
    fence: Arc<FenceState>,
    sender: Option<Sender<QueueOp>>,
    worker: Option<JoinHandle<()>>,
}

impl SimCommandQueue {
    fn spawn(latency: Duration, stall: bool) -> Result<Self> {
        let (sender, receiver) = unbounded::<QueueOp>();
        let fence = Arc::new(FenceState::default());
        let worker_fence = fence.clone();

        let worker = std::thread::Builder::new()
            .name("gdscan-sim-queue".into())
            .spawn(move || queue_worker(receiver, worker_fence, latency, stall))
            .map_err(|e| Error::Initialization(format!("failed to start command queue: {}", e)))?;

        Ok(Self {
            fence,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    fn send(&self, op: QueueOp) -> Result<()> {
        self.sender
            .as_ref()
            .ok_or_else(|| Error::Execution("command queue is closed".into()))?
            .send(op)
            .map_err(|_| Error::Execution("command queue worker is gone".into()))
    }

    fn is_alive(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }
}

impl Drop for SimCommandQueue {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn queue_worker(receiver: Receiver<QueueOp>, fence: Arc<FenceState>, latency: Duration, stall: bool) {
    for op in receiver {
        if stall {
            continue;
        }
        match op {
            QueueOp::Execute(commands) => {
                if !latency.is_zero() {
                    std::thread::sleep(latency);
                }
                for command in commands {
                    match command {
                        Command::Transition { buffer, before, after } => {
                            trace!("Buffer {} {} -> {}", buffer, before, after);
                        }
                        Command::Copy { src, dst, size } => {
                            let src = src.lock();
                            let mut dst = dst.lock();
                            dst[..size].copy_from_slice(&src[..size]);
                        }
                    }
                }
            }
            QueueOp::Signal(value) => {
                let mut completed = fence.completed.lock();
                if value > *completed {
                    *completed = value;
                }
                fence.reached.notify_all();
            }
        }
    }
}

#[derive(Default)]
struct SimCommandAllocator {
    resets: u64,
}

#[derive(Default)]
struct SimCommandList {
    commands: Vec<Command>,
}

/// Simulated GPU-direct device
pub struct SimDevice {
    // Fields drop in declaration order: queues and command objects go
    // before the memory pool backing the device.
    read_queue: SimReadQueue,
    command_list: SimCommandList,
    command_allocator: SimCommandAllocator,
    command_queue: SimCommandQueue,
    memory: Arc<MemoryPool>,
    info: DeviceInfo,
    fault: Option<SimFault>,
    lost: AtomicBool,
    next_buffer_id: AtomicU64,
    lists_executed: u64,
}

impl SimDevice {
    /// Diagnostic counters
    pub fn stats(&self) -> SimStats {
        let progress = self.read_queue.engine.progress.lock();
        SimStats {
            reads_submitted: progress.submitted,
            reads_completed: progress.completed,
            lists_executed: self.lists_executed,
        }
    }

    fn check_lost(&self) -> Result<()> {
        if self.lost.load(Ordering::Acquire) {
            return Err(Error::Execution("device removed".into()));
        }
        Ok(())
    }
}

impl GpuBackend for SimDevice {
    type Buffer = SimBuffer;
    type File = SimFile;
    type Config = SimConfig;

    fn initialize(config: &SimConfig, queue: &QueueDesc) -> Result<Self> {
        if config.fault == Some(SimFault::FailInitialize) {
            return Err(Error::Initialization("simulated device creation failed".into()));
        }
        if config.memory_limit == 0 {
            return Err(Error::Initialization("device reports no memory".into()));
        }

        debug!("Creating simulated device ({:?} priority)", queue.priority);

        let command_queue =
            SimCommandQueue::spawn(config.exec_latency, config.fault == Some(SimFault::StallCommandQueue))?;
        let read_queue = SimReadQueue::spawn(config.read_latency, config.fault == Some(SimFault::StallReads))?;

        Ok(Self {
            read_queue,
            command_list: SimCommandList::default(),
            command_allocator: SimCommandAllocator::default(),
            command_queue,
            memory: Arc::new(MemoryPool {
                limit: config.memory_limit,
                used: Mutex::new(0),
            }),
            info: DeviceInfo {
                name: config.name.clone(),
                backend: BackendType::Sim,
                ordinal: queue.ordinal,
                total_memory: config.memory_limit,
            },
            fault: config.fault,
            lost: AtomicBool::new(false),
            next_buffer_id: AtomicU64::new(1),
            lists_executed: 0,
        })
    }

    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn available_memory(&self) -> u64 {
        self.memory.available()
    }

    fn create_buffer(&self, size: u64, heap: HeapKind) -> Result<SimBuffer> {
        self.check_lost()?;
        let len = usize::try_from(size).map_err(|_| Error::InvalidBufferSize {
            requested: size,
            maximum: usize::MAX as u64,
        })?;

        self.memory.reserve(heap, size)?;
        Ok(SimBuffer {
            id: self.next_buffer_id.fetch_add(1, Ordering::Relaxed),
            heap,
            size,
            data: Arc::new(Mutex::new(vec![0u8; len])),
            reservation: Arc::new(Reservation {
                size,
                memory: self.memory.clone(),
            }),
        })
    }

    fn open_file(&self, path: &Path) -> Result<SimFile> {
        let file = File::open(path).map_err(|e| Error::file_open(path, e))?;
        let is_dir = file.metadata().map(|m| m.is_dir()).unwrap_or(false);
        if is_dir {
            return Err(Error::file_open(path, "is a directory"));
        }
        Ok(SimFile {
            path: path.to_path_buf(),
            file,
        })
    }

    fn file_size(&self, file: &SimFile) -> Result<u64> {
        file.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| Error::metadata(&file.path, e))
    }

    fn enqueue_read(&mut self, file: &SimFile, offset: u64, length: u64, dst: &SimBuffer) -> Result<()> {
        if length > dst.size {
            return Err(Error::InvalidParameter(format!(
                "read of {} bytes into {} byte buffer",
                length, dst.size
            )));
        }
        let handle = file
            .file
            .try_clone()
            .map_err(|e| Error::Execution(format!("failed to duplicate handle: {}", e)))?;

        self.read_queue.pending.push(ReadJob {
            path: file.path.clone(),
            file: handle,
            offset,
            length,
            dst: dst.data.clone(),
            _reservation: dst.reservation.clone(),
        });
        Ok(())
    }

    fn submit_reads(&mut self) -> Result<()> {
        self.check_lost()?;
        if self.read_queue.pending.is_empty() {
            return Ok(());
        }

        let jobs = std::mem::take(&mut self.read_queue.pending);
        let sender = self
            .read_queue
            .sender
            .as_ref()
            .ok_or_else(|| Error::Execution("transfer engine is closed".into()))?;

        self.read_queue.engine.progress.lock().submitted += jobs.len() as u64;
        for job in jobs {
            if sender.send(job).is_err() {
                let mut progress = self.read_queue.engine.progress.lock();
                progress.completed += 1;
                progress.errors.push("transfer engine worker is gone".into());
            }
        }
        Ok(())
    }

    fn wait_reads_idle(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let engine = &self.read_queue.engine;
        let mut progress = engine.progress.lock();

        while progress.completed < progress.submitted {
            if engine.idle.wait_until(&mut progress, deadline).timed_out()
                && progress.completed < progress.submitted
            {
                warn!(
                    "Transfer engine still has {} reads outstanding",
                    progress.submitted - progress.completed
                );
                return Err(Error::timeout("bulk read queue idle", timeout));
            }
        }

        if progress.errors.is_empty() {
            return Ok(());
        }
        let errors = std::mem::take(&mut progress.errors);
        Err(Error::Execution(errors.join("; ")))
    }

    fn record_transition(&mut self, buffer: &SimBuffer, before: ResourceState, after: ResourceState) -> Result<()> {
        if before == after {
            return Err(Error::InvalidParameter(format!("no-op transition on buffer {}", buffer.id)));
        }
        self.command_list.commands.push(Command::Transition {
            buffer: buffer.id,
            before,
            after,
        });
        Ok(())
    }

    fn record_copy(&mut self, src: &SimBuffer, dst: &SimBuffer) -> Result<()> {
        if Arc::ptr_eq(&src.data, &dst.data) {
            return Err(Error::InvalidParameter("copy source and destination alias".into()));
        }
        if src.size != dst.size {
            return Err(Error::InvalidParameter(format!(
                "copy of {} bytes into {} byte buffer",
                src.size, dst.size
            )));
        }
        self.command_list.commands.push(Command::Copy {
            src: src.data.clone(),
            dst: dst.data.clone(),
            size: src.size as usize,
        });
        Ok(())
    }

    fn execute_command_list(&mut self) -> Result<()> {
        self.check_lost()?;
        let commands = std::mem::take(&mut self.command_list.commands);
        self.command_allocator.resets += 1;

        match self.fault {
            Some(SimFault::RejectSubmissions) => {
                return Err(Error::Execution("command queue rejected the command list".into()));
            }
            Some(SimFault::LoseDevice) => {
                self.lost.store(true, Ordering::Release);
                return Err(Error::Execution("device removed during execution".into()));
            }
            _ => {}
        }

        self.command_queue.send(QueueOp::Execute(commands))?;
        self.lists_executed += 1;
        trace!("Executed command list (allocator reset {})", self.command_allocator.resets);
        Ok(())
    }

    fn signal_fence(&mut self, value: u64) -> Result<()> {
        self.check_lost()?;
        self.command_queue.send(QueueOp::Signal(value))
    }

    fn completed_fence_value(&self) -> u64 {
        *self.command_queue.fence.completed.lock()
    }

    fn wait_fence(&self, value: u64, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let fence = &self.command_queue.fence;
        let mut completed = fence.completed.lock();

        while *completed < value {
            if fence.reached.wait_until(&mut completed, deadline).timed_out() && *completed < value {
                return Err(Error::timeout("fence", timeout));
            }
        }
        Ok(())
    }

    fn read_mapped(&self, buffer: &SimBuffer, dst: &mut [u8]) -> Result<()> {
        if buffer.heap != HeapKind::Readback {
            return Err(Error::InvalidParameter("default heap buffers cannot be mapped".into()));
        }
        let data = buffer.data.lock();
        if dst.len() > data.len() {
            return Err(Error::InvalidParameter(format!(
                "map of {} bytes from {} byte buffer",
                dst.len(),
                data.len()
            )));
        }
        dst.copy_from_slice(&data[..dst.len()]);
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.check_lost()?;
        if !self.command_queue.is_alive() {
            return Err(Error::Execution("command queue worker stopped".into()));
        }
        if !self.read_queue.is_alive() {
            return Err(Error::Execution("transfer engine worker stopped".into()));
        }
        Ok(())
    }
}
