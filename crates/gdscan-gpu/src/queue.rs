//! Bulk read queue
//!
//! Moves file regions straight into device buffers. Reads are batched:
//! `enqueue_read` only registers a request, `submit` hands the batch to the
//! transfer engine and `wait_idle` is the single, queue-wide completion
//! barrier. There is no per-request completion event.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::backend::{GpuBackend, HeapKind, ResourceState};
use crate::buffer::ScopedBuffer;
use crate::{Error, Result};

/// A file opened on the bulk read queue
pub struct StorageFile<F> {
    path: PathBuf,
    handle: F,
    size: Option<u64>,
}

impl<F> StorageFile<F> {
    /// Path the file was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read request counters shared with the device context
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReadCounters {
    /// Enqueued but not submitted
    pub queued: u64,
    /// Submitted and not yet observed complete
    pub in_flight: u64,
}

impl ReadCounters {
    /// Whether any request is outstanding
    pub fn is_idle(&self) -> bool {
        self.queued == 0 && self.in_flight == 0
    }
}

/// Borrowed handle to the context's bulk read queue
pub struct BulkReadQueue<'a, B: GpuBackend> {
    backend: &'a mut B,
    counters: &'a mut ReadCounters,
    idle_timeout: Duration,
}

impl<'a, B: GpuBackend> BulkReadQueue<'a, B> {
    pub(crate) fn new(backend: &'a mut B, counters: &'a mut ReadCounters, idle_timeout: Duration) -> Self {
        Self {
            backend,
            counters,
            idle_timeout,
        }
    }

    /// Open a file for bulk reads
    ///
    /// # Errors
    /// `FileOpen` if the path does not exist or cannot be opened.
    pub fn open(&self, path: &Path) -> Result<StorageFile<B::File>> {
        let handle = self.backend.open_file(path)?;
        trace!("Opened {} on bulk read queue", path.display());
        Ok(StorageFile {
            path: path.to_path_buf(),
            handle,
            size: None,
        })
    }

    /// Size of an open file in bytes
    ///
    /// # Errors
    /// `Metadata` if the size cannot be determined.
    pub fn get_size(&self, file: &mut StorageFile<B::File>) -> Result<u64> {
        if let Some(size) = file.size {
            return Ok(size);
        }
        let size = self.backend.file_size(&file.handle)?;
        file.size = Some(size);
        Ok(size)
    }

    /// Register a read of `length` bytes at `offset` into `dst`
    ///
    /// `length` must equal the capacity of `dst` and the region must lie
    /// inside the file.
    pub fn enqueue_read(
        &mut self,
        file: &mut StorageFile<B::File>,
        offset: u64,
        length: u64,
        dst: &ScopedBuffer<B::Buffer>,
    ) -> Result<()> {
        if dst.heap() != HeapKind::Default {
            return Err(Error::InvalidParameter(format!(
                "bulk reads target the default heap, got a {} buffer",
                dst.heap()
            )));
        }
        dst.expect_state(ResourceState::CopyDestination)?;

        if length != dst.size() {
            return Err(Error::InvalidParameter(format!(
                "read length {} does not match buffer capacity {}",
                length,
                dst.size()
            )));
        }

        let file_size = self.get_size(file)?;
        let end = offset.checked_add(length).ok_or_else(|| {
            Error::InvalidParameter(format!("read region {}+{} overflows", offset, length))
        })?;
        if end > file_size {
            return Err(Error::InvalidParameter(format!(
                "read region {}..{} exceeds size {} of {}",
                offset,
                end,
                file_size,
                file.path.display()
            )));
        }

        self.backend.enqueue_read(&file.handle, offset, length, dst.inner())?;
        self.counters.queued += 1;
        trace!("Enqueued read of {} bytes from {}", length, file.path.display());
        Ok(())
    }

    /// Flush every enqueued read to the transfer engine
    pub fn submit(&mut self) -> Result<()> {
        self.backend.submit_reads()?;
        self.counters.in_flight += self.counters.queued;
        self.counters.queued = 0;
        Ok(())
    }

    /// Block until every submitted read has finished
    ///
    /// # Errors
    /// `Timeout` if the queue does not drain within the configured idle
    /// timeout; the reads stay in flight. `Execution` if a read failed, in
    /// which case the queue is drained.
    pub fn wait_idle(&mut self) -> Result<()> {
        let start = Instant::now();
        match self.backend.wait_reads_idle(self.idle_timeout) {
            Ok(()) => {
                debug!(
                    "Bulk read queue idle after {:?} ({} requests)",
                    start.elapsed(),
                    self.counters.in_flight
                );
                self.counters.in_flight = 0;
                Ok(())
            }
            Err(err @ Error::Timeout { .. }) => Err(err),
            Err(err) => {
                self.counters.in_flight = 0;
                Err(err)
            }
        }
    }

    /// Outstanding request counts
    pub fn counters(&self) -> ReadCounters {
        *self.counters
    }
}
