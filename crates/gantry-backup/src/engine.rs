//! Create and restore server-directory archives.

use std::fs::File;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{BackupError, BackupResult};

/// A finished archive, as recorded on the owning backup record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupOutcome {
    pub archive_path: PathBuf,
    pub size_bytes: u64,
    /// Hex sha-256 of the archive bytes.
    pub sha256: String,
}

/// A completed restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    /// Where the previous directory contents were moved, when there were
    /// any. The engine never deletes this; the caller decides when the
    /// restored directory is proven good and the copy can go.
    pub safety_copy: Option<PathBuf>,
}

/// Archive `source_dir` into a gzip-compressed tar at `archive_path`.
///
/// Entries are stored relative to `source_dir`. Any entry whose relative
/// path contains one of `exclude_patterns` as a substring is skipped, and
/// an excluded directory is skipped whole. The archive is written to a
/// `.partial` sibling and renamed into place only once complete.
pub fn create_backup(
    source_dir: &Path,
    archive_path: &Path,
    exclude_patterns: &[String],
) -> BackupResult<BackupOutcome> {
    if !source_dir.is_dir() {
        return Err(BackupError::SourceMissing(source_dir.to_path_buf()));
    }
    if let Some(parent) = archive_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let partial = PathBuf::from(format!("{}.partial", archive_path.display()));
    if let Err(e) = write_archive(source_dir, &partial, exclude_patterns) {
        let _ = std::fs::remove_file(&partial);
        return Err(e);
    }
    std::fs::rename(&partial, archive_path)?;

    let size_bytes = std::fs::metadata(archive_path)?.len();
    let sha256 = sha256_file(archive_path)?;
    info!(
        source = %source_dir.display(),
        archive = %archive_path.display(),
        size_bytes,
        "backup archive created"
    );
    Ok(BackupOutcome {
        archive_path: archive_path.to_path_buf(),
        size_bytes,
        sha256,
    })
}

/// Unpack `archive_path` into `target_dir`.
///
/// When `expected_sha256` is given, the archive checksum is verified before
/// anything else. Every entry is then validated against path traversal in a
/// first pass; one bad entry fails the whole restore with the target
/// untouched. An existing `target_dir` is moved aside to
/// `<target>.pre-restore-<epoch>` before unpacking, so even a restore that
/// fails mid-write leaves a recoverable copy on disk.
pub fn restore_backup(
    archive_path: &Path,
    target_dir: &Path,
    expected_sha256: Option<&str>,
) -> BackupResult<RestoreOutcome> {
    if !archive_path.is_file() {
        return Err(BackupError::ArchiveMissing(archive_path.to_path_buf()));
    }
    if let Some(expected) = expected_sha256 {
        let actual = sha256_file(archive_path)?;
        if actual != expected {
            return Err(BackupError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
    }
    validate_entries(archive_path)?;

    let safety_copy = if target_dir.exists() {
        let moved = pre_restore_path(target_dir);
        std::fs::rename(target_dir, &moved)?;
        info!(
            target = %target_dir.display(),
            safety_copy = %moved.display(),
            "existing directory moved aside"
        );
        Some(moved)
    } else {
        None
    };

    let decoder = GzDecoder::new(File::open(archive_path)?);
    let mut archive = tar::Archive::new(decoder);
    if let Err(e) = archive.unpack(target_dir) {
        if let Some(moved) = &safety_copy {
            warn!(
                safety_copy = %moved.display(),
                "restore failed, previous contents retained"
            );
        }
        return Err(BackupError::Io(e));
    }

    info!(
        archive = %archive_path.display(),
        target = %target_dir.display(),
        "backup restored"
    );
    Ok(RestoreOutcome { safety_copy })
}

/// Compute SHA-256 of a file and return the hex digest.
pub(crate) fn sha256_file(path: &Path) -> BackupResult<String> {
    let bytes = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn write_archive(source_dir: &Path, dest: &Path, exclude_patterns: &[String]) -> BackupResult<()> {
    let encoder = GzEncoder::new(File::create(dest)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut walker = WalkDir::new(source_dir).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry?;
        let Ok(rel) = entry.path().strip_prefix(source_dir) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            // The walk root itself.
            continue;
        }
        if is_excluded(rel, exclude_patterns) {
            debug!(path = %rel.display(), "excluded from backup");
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }
        if entry.file_type().is_dir() {
            builder.append_dir(rel, entry.path())?;
        } else if entry.file_type().is_file() {
            builder.append_path_with_name(entry.path(), rel)?;
        }
        // Symlinks and special files are not part of restorable state.
    }

    builder.into_inner()?.finish()?;
    Ok(())
}

/// Reject any entry that could write outside the restore target.
///
/// Runs over the whole archive before a single file is written: absolute
/// paths and `..` components both fail the restore.
fn validate_entries(archive_path: &Path) -> BackupResult<()> {
    let decoder = GzDecoder::new(File::open(archive_path)?);
    let mut archive = tar::Archive::new(decoder);
    for entry in archive.entries()? {
        let entry = entry?;
        let path = entry.path()?;
        let escapes = path.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes {
            return Err(BackupError::UnsafeEntry(path.display().to_string()));
        }
    }
    Ok(())
}

/// Substring match against the relative path, e.g. `logs/` or `.lock`.
fn is_excluded(rel: &Path, patterns: &[String]) -> bool {
    if patterns.is_empty() {
        return false;
    }
    let rel = rel.to_string_lossy();
    patterns
        .iter()
        .any(|p| !p.is_empty() && rel.contains(p.as_str()))
}

fn pre_restore_path(dir: &Path) -> PathBuf {
    PathBuf::from(format!("{}.pre-restore-{}", dir.display(), epoch_secs()))
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
