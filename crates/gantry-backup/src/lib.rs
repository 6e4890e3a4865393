//! gantry-backup — point-in-time snapshots of server working directories.
//!
//! Archives are gzip-compressed tarballs whose entries are paths relative
//! to the backed-up directory. Creation writes to a `.partial` sibling and
//! renames on success, so an interrupted run never leaves a truncated
//! archive in place of a good one. A restore verifies the archive checksum,
//! validates every entry against path traversal before writing anything,
//! and moves the existing directory aside as a safety copy that the engine
//! itself never deletes.
//!
//! All operations are synchronous; callers run them on blocking tasks.

pub mod engine;
pub mod error;

pub use engine::{BackupOutcome, RestoreOutcome, create_backup, restore_backup};
pub use error::{BackupError, BackupResult};
