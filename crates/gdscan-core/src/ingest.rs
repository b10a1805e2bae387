//! File ingestion: storage → device buffer → readback buffer → host
//!
//! Each file travels through the bulk read queue into a default-heap buffer,
//! is copied on the device into a readback buffer and is finally mapped into
//! host memory. Device buffers are scoped to a single call, so every early
//! return releases whatever was allocated up to that point.

use std::path::Path;

use gdscan_gpu::{DeviceContext, GpuBackend, HeapKind, ScopedBuffer, StorageFile};
use tracing::{debug, trace};

use crate::error::{at, IngestError, IngestStep};

/// Default upper bound on a single file (4 GiB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1 << 32;

/// Moves whole files through the device and back to the host
#[derive(Debug, Clone, Copy)]
pub struct FileIngestor {
    max_file_size: u64,
}

impl Default for FileIngestor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FILE_SIZE)
    }
}

impl FileIngestor {
    pub fn new(max_file_size: u64) -> Self {
        Self { max_file_size }
    }

    /// Ingest one file and return its bytes in a host-owned buffer
    ///
    /// A zero-length file yields an empty vector without allocating.
    ///
    /// # Errors
    /// An [`IngestError`] naming the step that failed. Device resources
    /// acquired before the failure are released before returning.
    pub fn ingest<B: GpuBackend>(
        &self,
        ctx: &mut DeviceContext<B>,
        path: &Path,
    ) -> Result<Vec<u8>, IngestError> {
        let (mut file, size) = {
            let mut queue = ctx.read_queue().map_err(at(path, IngestStep::Open))?;
            let mut file = queue.open(path).map_err(at(path, IngestStep::Open))?;
            let size = queue.get_size(&mut file).map_err(at(path, IngestStep::Size))?;
            (file, size)
        };
        debug!("Opened {} ({} bytes)", path.display(), size);

        if size == 0 {
            return Ok(Vec::new());
        }
        if size > self.max_file_size {
            return Err(IngestError::new(
                path,
                IngestStep::Allocate,
                gdscan_gpu::Error::InvalidBufferSize {
                    requested: size,
                    maximum: self.max_file_size,
                },
            ));
        }
        let len = usize::try_from(size).map_err(|_| {
            IngestError::new(
                path,
                IngestStep::Allocate,
                gdscan_gpu::Error::InvalidBufferSize {
                    requested: size,
                    maximum: usize::MAX as u64,
                },
            )
        })?;

        let mut device = ctx
            .allocate(size, HeapKind::Default)
            .map_err(at(path, IngestStep::Allocate))?;
        read_whole_file(ctx, &mut file, size, &device).map_err(at(path, IngestStep::Read))?;
        debug!("Read {} into device memory", path.display());

        let mut readback = ctx
            .allocate(size, HeapKind::Readback)
            .map_err(at(path, IngestStep::AllocateReadback))?;
        copy_to_readback(ctx, &mut device, &mut readback).map_err(at(path, IngestStep::Copy))?;
        debug!("Copied {} to readback memory", path.display());

        let mut host = vec![0u8; len];
        ctx.map_readback(&mut readback, &mut host)
            .map_err(at(path, IngestStep::Map))?;
        trace!("Mapped {} bytes of {}", len, path.display());

        Ok(host)
    }
}

fn read_whole_file<B: GpuBackend>(
    ctx: &mut DeviceContext<B>,
    file: &mut StorageFile<B::File>,
    size: u64,
    dst: &ScopedBuffer<B::Buffer>,
) -> gdscan_gpu::Result<()> {
    let mut queue = ctx.read_queue()?;
    queue.enqueue_read(file, 0, size, dst)?;
    queue.submit()?;
    queue.wait_idle()
}

fn copy_to_readback<B: GpuBackend>(
    ctx: &mut DeviceContext<B>,
    src: &mut ScopedBuffer<B::Buffer>,
    dst: &mut ScopedBuffer<B::Buffer>,
) -> gdscan_gpu::Result<()> {
    let mut pipeline = ctx.copy_pipeline()?;
    pipeline.copy(src, dst)?;
    let fence = pipeline.submit()?;
    pipeline.wait(fence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gdscan_gpu::{ContextConfig, ErrorKind, SimConfig, SimDevice, SimFault};
    use std::io::Write;

    fn context(config: SimConfig) -> DeviceContext<SimDevice> {
        let mut ctx = DeviceContext::new(ContextConfig {
            fence_timeout: std::time::Duration::from_millis(200),
            idle_timeout: std::time::Duration::from_millis(200),
            ..ContextConfig::default()
        });
        ctx.initialize(&config).unwrap();
        ctx
    }

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    #[test]
    fn test_ingest_returns_file_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"foo bar");
        let mut ctx = context(SimConfig::default());

        let bytes = FileIngestor::default().ingest(&mut ctx, &path).unwrap();
        assert_eq!(bytes, b"foo bar");

        let stats = ctx.buffers().stats();
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.live_buffers(), 0);
    }

    #[test]
    fn test_zero_length_file_skips_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "empty.txt", b"");
        let mut ctx = context(SimConfig::default());

        let bytes = FileIngestor::default().ingest(&mut ctx, &path).unwrap();
        assert!(bytes.is_empty());
        assert_eq!(ctx.buffers().stats().allocations, 0);
        assert_eq!(ctx.buffers().stats().failures, 0);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(SimConfig::default());

        let err = FileIngestor::default()
            .ingest(&mut ctx, &dir.path().join("missing.txt"))
            .unwrap_err();
        assert_eq!(err.step, IngestStep::Open);
        assert_eq!(err.kind(), ErrorKind::FileOpen);
        assert!(err.path.ends_with("missing.txt"));
    }

    #[test]
    fn test_oversized_file_rejected_before_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "big.bin", &[7u8; 64]);
        let mut ctx = context(SimConfig::default());

        let err = FileIngestor::new(32).ingest(&mut ctx, &path).unwrap_err();
        assert_eq!(err.step, IngestStep::Allocate);
        assert_eq!(err.kind(), ErrorKind::Allocation);
        assert_eq!(ctx.buffers().stats().allocations, 0);
    }

    #[test]
    fn test_readback_allocation_failure_releases_device_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "half.bin", &[1u8; 600]);
        let mut ctx = context(SimConfig {
            memory_limit: 1000,
            ..SimConfig::default()
        });

        let err = FileIngestor::default().ingest(&mut ctx, &path).unwrap_err();
        assert_eq!(err.step, IngestStep::AllocateReadback);
        assert_eq!(err.kind(), ErrorKind::Allocation);

        let stats = ctx.buffers().stats();
        assert_eq!(stats.live_buffers(), 0);
        assert_eq!(stats.live_bytes, 0);
        assert_eq!(ctx.backend().unwrap().available_memory(), 1000);
    }

    #[test]
    fn test_rejected_copy_is_tagged() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"payload");
        let mut ctx = context(SimConfig {
            fault: Some(SimFault::RejectSubmissions),
            ..SimConfig::default()
        });

        let err = FileIngestor::default().ingest(&mut ctx, &path).unwrap_err();
        assert_eq!(err.step, IngestStep::Copy);
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert_eq!(ctx.buffers().stats().live_buffers(), 0);
    }

    #[test]
    fn test_stalled_reads_time_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"payload");
        let mut ctx = context(SimConfig {
            fault: Some(SimFault::StallReads),
            ..SimConfig::default()
        });

        let err = FileIngestor::default().ingest(&mut ctx, &path).unwrap_err();
        assert_eq!(err.step, IngestStep::Read);
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_stalled_fence_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"payload");
        let mut ctx = context(SimConfig {
            fault: Some(SimFault::StallCommandQueue),
            ..SimConfig::default()
        });

        let err = FileIngestor::default().ingest(&mut ctx, &path).unwrap_err();
        assert_eq!(err.step, IngestStep::Copy);
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
