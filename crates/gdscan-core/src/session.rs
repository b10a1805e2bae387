//! Scan session: the `start` / `scan` / `stop` lifecycle

use std::path::Path;
use std::time::Duration;

use gdscan_config::{PriorityLevel, ScanConfig};
use gdscan_gpu::{ContextConfig, DeviceContext, DeviceInfo, GpuBackend, QueueDesc, QueuePriority};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::driver::{BatchDriver, DriverOptions, ScanReport};
use crate::matcher::{MatcherOptions, RegexMatcher};
use crate::{Error, Result};

/// Everything a session needs besides the backend configuration
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub context: ContextConfig,
    pub driver: DriverOptions,
    pub matcher: MatcherOptions,
}

impl SessionOptions {
    /// Derive session options from a validated configuration file
    pub fn from_config(config: &ScanConfig) -> Result<Self> {
        config.validate()?;

        let priority = match config.device.priority {
            PriorityLevel::Low => QueuePriority::Low,
            PriorityLevel::Normal => QueuePriority::Normal,
            PriorityLevel::High => QueuePriority::High,
        };

        Ok(Self {
            context: ContextConfig {
                queue: QueueDesc {
                    priority,
                    ordinal: config.device.ordinal as usize,
                },
                idle_timeout: Duration::from_millis(config.pipeline.idle_timeout_ms),
                fence_timeout: Duration::from_millis(config.pipeline.fence_timeout_ms),
            },
            driver: DriverOptions {
                max_file_size: config.pipeline.max_file_size,
                allocation_escalation_threshold: config.pipeline.allocation_escalation_threshold,
                execution_revalidate_threshold: config.pipeline.execution_revalidate_threshold,
            },
            matcher: MatcherOptions {
                mode: config.matching.mode.into(),
                case_insensitive: config.matching.case_insensitive,
            },
        })
    }
}

/// A device context plus the policy used to scan with it
///
/// The context sits behind a mutex, so a session can be shared between
/// threads; scans on one session are serialized.
pub struct ScanSession<B: GpuBackend> {
    context: Mutex<DeviceContext<B>>,
    backend_config: B::Config,
    options: SessionOptions,
}

impl<B: GpuBackend> ScanSession<B> {
    /// Create a stopped session
    pub fn new(backend_config: B::Config, options: SessionOptions) -> Self {
        Self {
            context: Mutex::new(DeviceContext::new(options.context.clone())),
            backend_config,
            options,
        }
    }

    /// Initialize the device context and bulk read queue
    ///
    /// # Errors
    /// `Initialization` if the device cannot be created, or if the session
    /// is already started.
    pub fn start(&self) -> Result<()> {
        let mut ctx = self.context.lock();
        ctx.initialize(&self.backend_config)
            .map_err(Error::Initialization)?;
        info!("Scan session started");
        Ok(())
    }

    /// Release every device resource. Safe to call repeatedly.
    pub fn stop(&self) {
        self.context.lock().shutdown();
    }

    pub fn is_started(&self) -> bool {
        self.context.lock().is_initialized()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Device the session runs on
    pub fn device_info(&self) -> Result<DeviceInfo> {
        let ctx = self.context.lock();
        ctx.device_info().cloned().map_err(|_| Error::NotInitialized)
    }

    /// Scan `paths` for `pattern`, one result per path in input order
    ///
    /// # Errors
    /// Only session-level problems: `NotInitialized`, `EmptyPattern` or
    /// `InvalidPattern`. These are raised before any device work. Per-file
    /// failures are reported in the returned results.
    pub fn scan<P: AsRef<Path>>(&self, paths: &[P], pattern: &str) -> Result<ScanReport> {
        let mut ctx = self.context.lock();
        if !ctx.is_initialized() {
            return Err(Error::NotInitialized);
        }

        let matcher = RegexMatcher::new(pattern, self.options.matcher)?;
        debug!("Scanning {} files for {:?}", paths.len(), matcher.pattern());

        let report = BatchDriver::new(&mut *ctx, &matcher, self.options.driver).run(paths);
        Ok(report)
    }

    /// Run `f` against the underlying device context
    pub fn with_context<R>(&self, f: impl FnOnce(&DeviceContext<B>) -> R) -> R {
        f(&self.context.lock())
    }
}
