//! Error types for device operations

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{HeapKind, ResourceState};

/// Result type for device operations
pub type Result<T> = std::result::Result<T, Error>;

/// Device operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Device, command queue or bulk read queue setup failed
    #[error("Failed to initialize device context: {0}")]
    Initialization(String),

    /// File could not be opened by the bulk read queue
    #[error("Failed to open {path}: {message}")]
    FileOpen {
        /// Path that was opened
        path: PathBuf,
        /// Error message
        message: String,
    },

    /// File size could not be determined
    #[error("Failed to read metadata for {path}: {message}")]
    Metadata {
        /// Path whose metadata was queried
        path: PathBuf,
        /// Error message
        message: String,
    },

    /// Device memory allocation failed
    #[error("Device allocation failed on {heap} heap: {size} bytes requested, {available} bytes available")]
    OutOfMemory {
        /// Heap the buffer was requested from
        heap: HeapKind,
        /// Requested size
        size: u64,
        /// Available memory
        available: u64,
    },

    /// Invalid buffer size
    #[error("Invalid buffer size: requested {requested}, maximum {maximum}")]
    InvalidBufferSize {
        /// Requested size
        requested: u64,
        /// Maximum allowed
        maximum: u64,
    },

    /// Command submission or execution failed
    #[error("Device execution failed: {0}")]
    Execution(String),

    /// Buffer used in a residency state that does not allow the operation
    #[error("Invalid resource state: expected {expected}, found {actual}")]
    InvalidState {
        /// State required by the operation
        expected: ResourceState,
        /// State the buffer was in
        actual: ResourceState,
    },

    /// A blocking wait did not complete in time
    #[error("Timed out after {waited:?} waiting for {operation}")]
    Timeout {
        /// What was being waited on
        operation: &'static str,
        /// How long the caller waited
        waited: Duration,
    },

    /// Device context used before initialization or after shutdown
    #[error("Device context is not initialized")]
    NotInitialized,

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Classification of errors, independent of the message payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Device or queue setup failed
    Initialization,
    /// File could not be opened
    FileOpen,
    /// File size could not be determined
    Metadata,
    /// Device allocation failed or size was invalid
    Allocation,
    /// Command submission, copy or read failed
    Execution,
    /// A queue-idle or fence wait expired
    Timeout,
    /// Used before `start` or after `stop`
    NotInitialized,
}

impl ErrorKind {
    /// Name used in reports
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Initialization => "InitializationError",
            ErrorKind::FileOpen => "FileOpenError",
            ErrorKind::Metadata => "MetadataError",
            ErrorKind::Allocation => "AllocationError",
            ErrorKind::Execution => "ExecutionError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::NotInitialized => "NotInitializedError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Create a file open error
    #[inline]
    pub fn file_open(path: impl Into<PathBuf>, err: impl fmt::Display) -> Self {
        Self::FileOpen { path: path.into(), message: err.to_string() }
    }

    /// Create a metadata error
    #[inline]
    pub fn metadata(path: impl Into<PathBuf>, err: impl fmt::Display) -> Self {
        Self::Metadata { path: path.into(), message: err.to_string() }
    }

    /// Create an out-of-memory error
    #[inline]
    pub fn out_of_memory(heap: HeapKind, size: u64, available: u64) -> Self {
        Self::OutOfMemory { heap, size, available }
    }

    /// Create a timeout error
    #[inline]
    pub fn timeout(operation: &'static str, waited: Duration) -> Self {
        Self::Timeout { operation, waited }
    }

    /// Taxonomy bucket this error belongs to
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Initialization(_) => ErrorKind::Initialization,
            Self::FileOpen { .. } => ErrorKind::FileOpen,
            Self::Metadata { .. } => ErrorKind::Metadata,
            Self::OutOfMemory { .. } | Self::InvalidBufferSize { .. } => ErrorKind::Allocation,
            Self::Execution(_) | Self::InvalidState { .. } | Self::InvalidParameter(_) => {
                ErrorKind::Execution
            }
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::NotInitialized => ErrorKind::NotInitialized,
        }
    }

    /// Check if error is isolated to a single file
    ///
    /// Initialization and usage errors poison the whole session.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Initialization | ErrorKind::NotInitialized)
    }
}

#[cfg(feature = "cuda")]
impl From<cudarc::driver::DriverError> for Error {
    fn from(err: cudarc::driver::DriverError) -> Self {
        Error::Execution(format!("{:?}", err))
    }
}
