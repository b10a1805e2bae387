//! Session and per-file error types

use std::fmt;
use std::path::{Path, PathBuf};

use gdscan_gpu::ErrorKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Session-level errors
///
/// These abort a whole `scan` call. Anything that goes wrong with an
/// individual file is reported in that file's result instead.
#[derive(Debug, Error)]
pub enum Error {
    /// `scan` called before `start` or after `stop`
    #[error("scan session is not started")]
    NotInitialized,

    /// Device context could not be created
    #[error("initialization failed: {0}")]
    Initialization(#[source] gdscan_gpu::Error),

    /// Pattern is the empty string
    #[error("pattern must not be empty")]
    EmptyPattern,

    /// Pattern is not a valid regular expression
    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// Configuration rejected
    #[error("configuration error: {0}")]
    Config(#[from] gdscan_config::ConfigError),
}

impl Error {
    /// Taxonomy bucket, for errors that have one
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::NotInitialized => Some(ErrorKind::NotInitialized),
            Error::Initialization(_) => Some(ErrorKind::Initialization),
            _ => None,
        }
    }
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ingestion step at which a file failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStep {
    Open,
    Size,
    Allocate,
    Read,
    AllocateReadback,
    Copy,
    Map,
}

impl fmt::Display for IngestStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IngestStep::Open => "open",
            IngestStep::Size => "size",
            IngestStep::Allocate => "allocate",
            IngestStep::Read => "read",
            IngestStep::AllocateReadback => "allocate readback",
            IngestStep::Copy => "copy",
            IngestStep::Map => "map",
        };
        f.write_str(name)
    }
}

/// A device error tagged with the file and step it occurred at
#[derive(Debug, Error)]
#[error("{step} failed for {}: {source}", path.display())]
pub struct IngestError {
    pub path: PathBuf,
    pub step: IngestStep,
    #[source]
    pub source: gdscan_gpu::Error,
}

impl IngestError {
    pub fn new(path: impl Into<PathBuf>, step: IngestStep, source: gdscan_gpu::Error) -> Self {
        Self {
            path: path.into(),
            step,
            source,
        }
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

/// Tag errors from one ingestion step with the file being ingested
pub(crate) fn at(path: &Path, step: IngestStep) -> impl FnOnce(gdscan_gpu::Error) -> IngestError + '_ {
    move |source| IngestError::new(path, step, source)
}
