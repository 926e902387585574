//! Error types for pqflash.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by index loading, searching, and cache warm-up.
#[derive(Debug, Error)]
pub enum PqFlashError {
    /// A required index file does not exist.
    #[error("missing index file: {}", .0.display())]
    MissingFile(PathBuf),

    /// An index file exists but its contents do not match the expected
    /// format (bad header, inconsistent shapes, unsupported flags).
    #[error("format mismatch in {file}: {reason}")]
    FormatMismatch { file: String, reason: String },

    /// The requested distance metric is not supported by the loaded index.
    #[error("unsupported metric: {0}")]
    UnsupportedMetric(String),

    /// A sector parsed during a query contained an invalid record. Fatal to
    /// the query; the index itself stays usable.
    #[error("corrupt index at byte offset {sector_offset}: {reason}")]
    CorruptIndex { sector_offset: u64, reason: String },

    /// An I/O failure from the aligned reader. Aborts the current beam; no
    /// partial results are returned.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A caller-supplied parameter is out of range (`k = 0`, `L < k`,
    /// `beam_width = 0`, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The asynchronous cache warm-up task was cancelled before completion.
    #[error("cache warm-up cancelled")]
    Cancelled,
}

/// Result type alias for pqflash operations.
pub type Result<T> = std::result::Result<T, PqFlashError>;
