use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Convenience result type for differ operations.
pub type DiffResult<T> = std::result::Result<T, DiffError>;

/// Error type for reading exports and running the diff engine.
///
/// The reader recovers locally from new-format parse failures by retrying
/// the legacy decoder; every other error propagates to the top level and
/// aborts the run. `InvariantViolation` indicates a bug and halts the
/// engine immediately.
#[derive(Debug, Error)]
pub enum DiffError {
    /// The input export file does not exist.
    #[error("input file not found: {}", .path.display())]
    NotFound { path: PathBuf },

    /// The export file is malformed. `phase` names the record that failed.
    #[error("failed to parse {} ({}): {}", .path.display(), .phase, .message)]
    Parse {
        path: PathBuf,
        phase: &'static str,
        message: String,
    },

    /// A single record exceeded the per-record size bound. Raised before
    /// the record buffer is allocated.
    #[error("record too large in {}: {} bytes exceeds the {} byte limit", .path.display(), .size, .limit)]
    RecordTooLarge { path: PathBuf, size: u64, limit: u64 },

    /// An internal invariant was broken, e.g. a duplicate fixed-point
    /// insertion.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Read or write failure on the underlying file.
    #[error("i/o error on {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The host requested cancellation between rigor levels.
    #[error("operation cancelled")]
    Cancelled,
}
