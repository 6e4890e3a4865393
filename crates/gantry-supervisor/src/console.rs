//! Rolling console log — one file per server, rotated once at a size cap.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Appends console lines to `console.log`, renaming it to `console.log.1`
/// when the size cap is reached. At most one rotated file is kept.
///
/// A log that fails to open is disabled rather than fatal: the console
/// still streams over the bus, only the on-disk copy is lost.
pub struct RollingLog {
    path: PathBuf,
    max_bytes: u64,
    file: Option<File>,
    written: u64,
}

impl RollingLog {
    /// Open (or create) the log file, appending to any existing content.
    pub async fn open(path: PathBuf, max_bytes: u64) -> Self {
        match open_append(&path).await {
            Ok((file, len)) => Self {
                path,
                max_bytes,
                file: Some(file),
                written: len,
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "console log disabled");
                Self {
                    path,
                    max_bytes,
                    file: None,
                    written: 0,
                }
            }
        }
    }

    /// Append one console line, tagged with its stream name.
    pub async fn append(&mut self, stream: &str, line: &str) -> std::io::Result<()> {
        if self.file.is_none() {
            return Ok(());
        }

        let entry = format!("[{stream}] {line}\n");
        if self.written + entry.len() as u64 > self.max_bytes {
            self.rotate().await?;
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(entry.as_bytes()).await?;
            file.flush().await?;
            self.written += entry.len() as u64;
        }
        Ok(())
    }

    async fn rotate(&mut self) -> std::io::Result<()> {
        self.file = None;
        let rotated = PathBuf::from(format!("{}.1", self.path.display()));
        tokio::fs::rename(&self.path, &rotated).await?;
        let (file, len) = open_append(&self.path).await?;
        self.file = Some(file);
        self.written = len;
        Ok(())
    }
}

async fn open_append(path: &Path) -> std::io::Result<(File, u64)> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    let len = file.metadata().await?.len();
    Ok((file, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn appends_tagged_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("console.log");
        let mut log = RollingLog::open(path.clone(), 1024 * 1024).await;

        log.append("stdout", "server started").await.unwrap();
        log.append("stderr", "warning: low memory").await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "[stdout] server started\n[stderr] warning: low memory\n");
    }

    #[tokio::test]
    async fn rotates_at_the_size_cap() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("console.log");
        // Cap small enough that the second line triggers rotation.
        let mut log = RollingLog::open(path.clone(), 24).await;

        log.append("stdout", "first line").await.unwrap();
        log.append("stdout", "second line").await.unwrap();

        let rotated = tokio::fs::read_to_string(dir.path().join("console.log.1"))
            .await
            .unwrap();
        assert_eq!(rotated, "[stdout] first line\n");

        let current = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(current, "[stdout] second line\n");
    }

    #[tokio::test]
    async fn resumes_appending_to_an_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("console.log");

        {
            let mut log = RollingLog::open(path.clone(), 1024).await;
            log.append("stdout", "before").await.unwrap();
        }
        let mut log = RollingLog::open(path.clone(), 1024).await;
        log.append("stdout", "after").await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "[stdout] before\n[stdout] after\n");
    }

    #[tokio::test]
    async fn unopenable_log_is_disabled_not_fatal() {
        // A directory at the log path makes the open fail.
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("console.log");
        tokio::fs::create_dir(&path).await.unwrap();

        let mut log = RollingLog::open(path, 1024).await;
        assert!(log.append("stdout", "dropped").await.is_ok());
    }
}
