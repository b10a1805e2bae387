//! GPU-direct bulk file scanning
//!
//! Files are moved from storage into device memory through the bulk read
//! queue, copied back through a readback buffer and handed to a pattern
//! matcher. A [`ScanSession`] owns the device context for its lifetime:
//!
//! ```no_run
//! use gdscan_core::{ScanSession, SessionOptions};
//! use gdscan_gpu::{SimConfig, SimDevice};
//!
//! # fn main() -> gdscan_core::Result<()> {
//! let session = ScanSession::<SimDevice>::new(SimConfig::default(), SessionOptions::default());
//! session.start()?;
//!
//! let report = session.scan(&["a.txt", "b.txt"], "foo")?;
//! for result in &report.results {
//!     println!("{}", result);
//! }
//!
//! session.stop();
//! # Ok(())
//! # }
//! ```

pub mod driver;
pub mod error;
pub mod ingest;
pub mod matcher;
pub mod session;

pub use driver::{BatchDriver, DriverOptions, FileError, FileResult, ScanReport, ScanStats};
pub use error::{Error, IngestError, IngestStep, Result};
pub use ingest::{FileIngestor, DEFAULT_MAX_FILE_SIZE};
pub use matcher::{MatchMode, MatcherOptions, PatternMatcher, RegexMatcher};
pub use session::{ScanSession, SessionOptions};
