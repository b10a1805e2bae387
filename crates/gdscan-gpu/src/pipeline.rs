//! Copy/transition pipeline
//!
//! Records a state transition plus a full-buffer copy on the context's
//! command list and submits it. Submission never waits; it returns the fence
//! value that will mark the copy as retired.

use std::time::Duration;

use tracing::{debug, trace};

use crate::backend::{GpuBackend, ResourceState};
use crate::buffer::ScopedBuffer;
use crate::fence::{Fence, FenceValue};
use crate::queue::ReadCounters;
use crate::{Error, Result};

/// Borrowed handle to the context's command list and fence
pub struct CopyPipeline<'a, B: GpuBackend> {
    backend: &'a mut B,
    fence: &'a mut Fence,
    reads: ReadCounters,
    fence_timeout: Duration,
    recorded: usize,
}

impl<'a, B: GpuBackend> CopyPipeline<'a, B> {
    pub(crate) fn new(
        backend: &'a mut B,
        fence: &'a mut Fence,
        reads: ReadCounters,
        fence_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            fence,
            reads,
            fence_timeout,
            recorded: 0,
        }
    }

    /// Record `src` → `dst`: transition `src` from `CopyDestination` to
    /// `CopySource`, then copy the whole buffer.
    ///
    /// The read queue must be idle, otherwise the source may still be
    /// receiving bytes.
    pub fn copy(
        &mut self,
        src: &mut ScopedBuffer<B::Buffer>,
        dst: &mut ScopedBuffer<B::Buffer>,
    ) -> Result<()> {
        if !self.reads.is_idle() {
            return Err(Error::Execution(format!(
                "copy recorded while {} bulk reads are outstanding",
                self.reads.queued + self.reads.in_flight
            )));
        }
        if src.size() != dst.size() {
            return Err(Error::InvalidParameter(format!(
                "copy source is {} bytes, destination is {} bytes",
                src.size(),
                dst.size()
            )));
        }
        src.expect_state(ResourceState::CopyDestination)?;
        dst.expect_state(ResourceState::CopyDestination)?;

        self.backend.record_transition(
            src.inner(),
            ResourceState::CopyDestination,
            ResourceState::CopySource,
        )?;
        src.set_state(ResourceState::CopySource);

        self.backend.record_copy(src.inner(), dst.inner())?;
        dst.set_pending_fence(self.fence.next_value());
        self.recorded += 1;

        trace!("Recorded {} byte {} -> {} copy", src.size(), src.heap(), dst.heap());
        Ok(())
    }

    /// Execute the command list and signal the fence behind it
    ///
    /// Returns without waiting; pass the value to [`CopyPipeline::wait`].
    pub fn submit(&mut self) -> Result<FenceValue> {
        self.backend.execute_command_list()?;
        let value = self.fence.signal(&mut *self.backend)?;
        debug!("Submitted {} copies, fence {}", self.recorded, value);
        self.recorded = 0;
        Ok(value)
    }

    /// Block until `value` is reached, bounded by the fence timeout
    pub fn wait(&self, value: FenceValue) -> Result<()> {
        self.fence.wait(&*self.backend, value, self.fence_timeout)
    }

    /// Copies recorded since the last submission
    pub fn recorded(&self) -> usize {
        self.recorded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeapKind;
    use crate::backends::sim::{SimConfig, SimDevice, SimFault};
    use crate::context::{ContextConfig, DeviceContext};

    fn context(config: SimConfig) -> DeviceContext<SimDevice> {
        let mut ctx = DeviceContext::new(ContextConfig {
            fence_timeout: Duration::from_millis(200),
            ..Default::default()
        });
        ctx.initialize(&config).unwrap();
        ctx
    }

    #[test]
    fn test_copy_transitions_source() {
        let mut ctx = context(SimConfig::default());
        let mut src = ctx.allocate(64, HeapKind::Default).unwrap();
        let mut dst = ctx.allocate(64, HeapKind::Readback).unwrap();

        let mut pipeline = ctx.copy_pipeline().unwrap();
        pipeline.copy(&mut src, &mut dst).unwrap();
        assert_eq!(src.state(), ResourceState::CopySource);
        assert_eq!(dst.state(), ResourceState::CopyDestination);
        assert_eq!(pipeline.recorded(), 1);

        let value = pipeline.submit().unwrap();
        assert_eq!(dst.pending_fence(), Some(value));
        pipeline.wait(value).unwrap();
        assert_eq!(pipeline.recorded(), 0);
    }

    #[test]
    fn test_copy_twice_rejected() {
        let mut ctx = context(SimConfig::default());
        let mut src = ctx.allocate(8, HeapKind::Default).unwrap();
        let mut dst = ctx.allocate(8, HeapKind::Readback).unwrap();

        let mut pipeline = ctx.copy_pipeline().unwrap();
        pipeline.copy(&mut src, &mut dst).unwrap();
        let err = pipeline.copy(&mut src, &mut dst).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                expected: ResourceState::CopyDestination,
                actual: ResourceState::CopySource,
            }
        ));
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let mut ctx = context(SimConfig::default());
        let mut src = ctx.allocate(8, HeapKind::Default).unwrap();
        let mut dst = ctx.allocate(16, HeapKind::Readback).unwrap();

        let mut pipeline = ctx.copy_pipeline().unwrap();
        assert!(matches!(
            pipeline.copy(&mut src, &mut dst),
            Err(Error::InvalidParameter(_))
        ));
        assert_eq!(src.state(), ResourceState::CopyDestination);
    }

    #[test]
    fn test_rejected_submission() {
        let mut ctx = context(SimConfig {
            fault: Some(SimFault::RejectSubmissions),
            ..Default::default()
        });
        let mut src = ctx.allocate(8, HeapKind::Default).unwrap();
        let mut dst = ctx.allocate(8, HeapKind::Readback).unwrap();

        let mut pipeline = ctx.copy_pipeline().unwrap();
        pipeline.copy(&mut src, &mut dst).unwrap();
        assert!(matches!(pipeline.submit(), Err(Error::Execution(_))));
    }

    #[test]
    fn test_stalled_queue_times_out() {
        let mut ctx = context(SimConfig {
            fault: Some(SimFault::StallCommandQueue),
            ..Default::default()
        });
        let mut src = ctx.allocate(8, HeapKind::Default).unwrap();
        let mut dst = ctx.allocate(8, HeapKind::Readback).unwrap();

        let mut pipeline = ctx.copy_pipeline().unwrap();
        pipeline.copy(&mut src, &mut dst).unwrap();
        let value = pipeline.submit().unwrap();
        assert!(matches!(pipeline.wait(value), Err(Error::Timeout { .. })));
    }

    #[test]
    fn test_copy_refused_while_reads_outstanding() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"pending!").unwrap();
        file.flush().unwrap();

        let mut ctx: DeviceContext<SimDevice> = DeviceContext::new(ContextConfig {
            idle_timeout: Duration::from_millis(20),
            fence_timeout: Duration::from_millis(200),
            ..Default::default()
        });
        ctx.initialize(&SimConfig {
            fault: Some(SimFault::StallReads),
            ..Default::default()
        })
        .unwrap();
        let mut src = ctx.allocate(8, HeapKind::Default).unwrap();
        let mut dst = ctx.allocate(8, HeapKind::Readback).unwrap();

        let mut queue = ctx.read_queue().unwrap();
        let mut storage = queue.open(file.path()).unwrap();
        queue.enqueue_read(&mut storage, 0, 8, &src).unwrap();
        queue.submit().unwrap();
        assert!(matches!(queue.wait_idle(), Err(Error::Timeout { .. })));
        assert_eq!(queue.counters().in_flight, 1);

        let mut pipeline = ctx.copy_pipeline().unwrap();
        assert!(matches!(
            pipeline.copy(&mut src, &mut dst),
            Err(Error::Execution(_))
        ));
        assert_eq!(pipeline.recorded(), 0);
        assert_eq!(src.state(), ResourceState::CopyDestination);
    }
}
