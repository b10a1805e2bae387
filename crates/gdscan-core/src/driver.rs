//! Batch driver: ingest and match an ordered list of files
//!
//! Every path produces exactly one [`FileResult`], in input order. A failing
//! file never stops the batch. Runs of device failures are escalated: repeated
//! allocation failures flag the report as resource exhausted, and repeated
//! execution failures trigger a device health check that, if it fails, marks
//! every remaining file without touching the device again.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use gdscan_gpu::{DeviceContext, ErrorKind, GpuBackend};
use serde::{Serialize, Serializer};
use tracing::{debug, error, info, warn};

use crate::error::{IngestError, IngestStep};
use crate::ingest::{FileIngestor, DEFAULT_MAX_FILE_SIZE};
use crate::matcher::PatternMatcher;

/// Batch policy knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverOptions {
    pub max_file_size: u64,
    /// Consecutive allocation failures that flag resource exhaustion
    pub allocation_escalation_threshold: u32,
    /// Consecutive execution failures that trigger device revalidation
    pub execution_revalidate_threshold: u32,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            allocation_escalation_threshold: 3,
            execution_revalidate_threshold: 2,
        }
    }
}

/// Why a single file failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileError {
    #[serde(serialize_with = "kind_name")]
    pub kind: ErrorKind,
    /// Step that failed, absent when the file was never attempted
    pub step: Option<IngestStep>,
    pub message: String,
}

fn kind_name<S: Serializer>(kind: &ErrorKind, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(kind.as_str())
}

impl From<&IngestError> for FileError {
    fn from(err: &IngestError) -> Self {
        Self {
            kind: err.kind(),
            step: Some(err.step),
            message: err.source.to_string(),
        }
    }
}

/// Outcome for one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileResult {
    pub path: PathBuf,
    /// Pattern found somewhere in the file; false on error
    pub matched: bool,
    pub match_count: usize,
    /// Bytes ingested
    pub bytes: u64,
    pub error: Option<FileError>,
}

impl FileResult {
    fn ok(path: &Path, bytes: u64, match_count: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            matched: match_count > 0,
            match_count,
            bytes,
            error: None,
        }
    }

    fn failed(path: &Path, error: FileError) -> Self {
        Self {
            path: path.to_path_buf(),
            matched: false,
            match_count: 0,
            bytes: 0,
            error: Some(error),
        }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Error kind, if the file failed
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

impl fmt::Display for FileResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = self.path.display();
        match &self.error {
            Some(err) => write!(f, "{}: error {}: {}", path, err.kind, err.message),
            None if self.matched => write!(f, "{}: match ({})", path, self.match_count),
            None => write!(f, "{}: no match", path),
        }
    }
}

/// Aggregate counters for a batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub files: usize,
    pub matched: usize,
    pub failed: usize,
    pub bytes_ingested: u64,
    pub elapsed: Duration,
}

/// Results of a batch, in input order
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub results: Vec<FileResult>,
    pub stats: ScanStats,
    /// Allocation failures reached the escalation threshold
    pub resource_exhausted: bool,
}

impl ScanReport {
    pub fn has_failures(&self) -> bool {
        self.stats.failed > 0
    }
}

/// Failure runs observed so far in a batch
#[derive(Debug, Default)]
struct Escalation {
    allocation_streak: u32,
    execution_streak: u32,
    resource_exhausted: bool,
    lost: Option<String>,
}

/// Runs ingestion and matching over a list of files on one device context
pub struct BatchDriver<'a, B: GpuBackend, M: PatternMatcher> {
    ctx: &'a mut DeviceContext<B>,
    matcher: &'a M,
    ingestor: FileIngestor,
    options: DriverOptions,
}

impl<'a, B: GpuBackend, M: PatternMatcher> BatchDriver<'a, B, M> {
    pub fn new(ctx: &'a mut DeviceContext<B>, matcher: &'a M, options: DriverOptions) -> Self {
        Self {
            ctx,
            matcher,
            ingestor: FileIngestor::new(options.max_file_size),
            options,
        }
    }

    /// Process every path in order
    pub fn run<P: AsRef<Path>>(&mut self, paths: &[P]) -> ScanReport {
        let start = Instant::now();
        let mut escalation = Escalation::default();
        let mut results = Vec::with_capacity(paths.len());

        for path in paths {
            let path = path.as_ref();
            let result = match &escalation.lost {
                Some(reason) => FileResult::failed(
                    path,
                    FileError {
                        kind: ErrorKind::Execution,
                        step: None,
                        message: format!("device context lost: {}", reason),
                    },
                ),
                None => self.scan_one(path, &mut escalation),
            };
            results.push(result);
        }

        let stats = ScanStats {
            files: results.len(),
            matched: results.iter().filter(|r| r.matched).count(),
            failed: results.iter().filter(|r| !r.is_ok()).count(),
            bytes_ingested: results.iter().map(|r| r.bytes).sum(),
            elapsed: start.elapsed(),
        };
        info!(
            "Scanned {} files ({} matched, {} failed, {} bytes) in {:?}",
            stats.files, stats.matched, stats.failed, stats.bytes_ingested, stats.elapsed
        );

        ScanReport {
            results,
            stats,
            resource_exhausted: escalation.resource_exhausted,
        }
    }

    fn scan_one(&mut self, path: &Path, escalation: &mut Escalation) -> FileResult {
        match self.ingestor.ingest(self.ctx, path) {
            Ok(bytes) => {
                escalation.allocation_streak = 0;
                escalation.execution_streak = 0;
                let count = self.matcher.count_matches(&bytes);
                debug!("{}: {} matches in {} bytes", path.display(), count, bytes.len());
                FileResult::ok(path, bytes.len() as u64, count)
            }
            Err(err) => {
                warn!("{}", err);
                self.escalate(&err, escalation);
                FileResult::failed(path, FileError::from(&err))
            }
        }
    }

    fn escalate(&self, err: &IngestError, escalation: &mut Escalation) {
        if !err.source.is_recoverable() {
            error!("Device context unusable: {}", err.source);
            escalation.lost = Some(err.source.to_string());
            return;
        }
        match err.kind() {
            ErrorKind::Allocation => {
                escalation.execution_streak = 0;
                escalation.allocation_streak += 1;
                if escalation.allocation_streak == self.options.allocation_escalation_threshold {
                    warn!(
                        "{} consecutive allocation failures, device memory is exhausted",
                        escalation.allocation_streak
                    );
                    escalation.resource_exhausted = true;
                }
            }
            ErrorKind::Execution | ErrorKind::Timeout => {
                escalation.allocation_streak = 0;
                escalation.execution_streak += 1;
                if escalation.execution_streak >= self.options.execution_revalidate_threshold {
                    match self.ctx.validate() {
                        Ok(()) => {
                            info!(
                                "Device still healthy after {} execution failures",
                                escalation.execution_streak
                            );
                            escalation.execution_streak = 0;
                        }
                        Err(e) => {
                            error!("Device context lost: {}", e);
                            escalation.lost = Some(e.to_string());
                        }
                    }
                }
            }
            // Storage-side failures say nothing about the device
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{MatcherOptions, RegexMatcher};
    use gdscan_gpu::{ContextConfig, SimConfig, SimDevice};

    #[test]
    fn test_display() {
        let ok = FileResult::ok(Path::new("a.txt"), 7, 2);
        assert_eq!(ok.to_string(), "a.txt: match (2)");

        let miss = FileResult::ok(Path::new("b.txt"), 3, 0);
        assert_eq!(miss.to_string(), "b.txt: no match");

        let failed = FileResult::failed(
            Path::new("c.txt"),
            FileError {
                kind: ErrorKind::FileOpen,
                step: Some(IngestStep::Open),
                message: "not found".into(),
            },
        );
        assert_eq!(failed.to_string(), "c.txt: error FileOpenError: not found");
        assert!(!failed.matched);
    }

    #[test]
    fn test_error_serializes_kind_name() {
        let err = FileError {
            kind: ErrorKind::Allocation,
            step: Some(IngestStep::AllocateReadback),
            message: "oom".into(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "AllocationError");
        assert_eq!(json["step"], "allocate_readback");
    }

    #[test]
    fn test_empty_batch() {
        let mut ctx = DeviceContext::<SimDevice>::new(ContextConfig::default());
        ctx.initialize(&SimConfig::default()).unwrap();
        let matcher = RegexMatcher::new("foo", MatcherOptions::default()).unwrap();

        let report = BatchDriver::new(&mut ctx, &matcher, DriverOptions::default()).run::<PathBuf>(&[]);
        assert!(report.results.is_empty());
        assert_eq!(report.stats.files, 0);
        assert!(!report.has_failures());
    }

    #[test]
    fn test_unusable_context_fails_remaining_files() {
        let mut ctx = DeviceContext::<SimDevice>::new(ContextConfig::default());
        let matcher = RegexMatcher::new("foo", MatcherOptions::default()).unwrap();

        let paths = [PathBuf::from("a.txt"), PathBuf::from("b.txt"), PathBuf::from("c.txt")];
        let report = BatchDriver::new(&mut ctx, &matcher, DriverOptions::default()).run(&paths);

        assert_eq!(report.stats.failed, 3);
        let first = report.results[0].error.as_ref().unwrap();
        assert_eq!(first.kind, ErrorKind::NotInitialized);
        assert_eq!(first.step, Some(IngestStep::Open));
        for result in &report.results[1..] {
            let error = result.error.as_ref().unwrap();
            assert_eq!(error.step, None);
            assert!(error.message.starts_with("device context lost"));
        }
    }
}
