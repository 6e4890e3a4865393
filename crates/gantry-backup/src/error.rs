//! Backup engine errors.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    /// The directory to back up does not exist or is not a directory.
    #[error("source directory not found: {0}")]
    SourceMissing(PathBuf),

    #[error("backup archive not found: {0}")]
    ArchiveMissing(PathBuf),

    /// The archive does not match the checksum recorded at creation.
    #[error("archive checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// An archive entry would resolve outside the restore target.
    #[error("archive entry escapes the restore target: {0}")]
    UnsafeEntry(String),

    #[error("directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("archive I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for backup operations.
pub type BackupResult<T> = Result<T, BackupError>;
