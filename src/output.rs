//! Bounded output capture.
//!
//! A job's sandbox may produce unbounded output, so truncation is enforced
//! by the sink itself rather than by whoever fills it. The sink writes
//! through to the requester-side destination file as chunks arrive, which
//! is what lets `poll` return partial output for a still-running job.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::error::Result;

/// File-backed byte sink with a hard size limit.
pub struct BoundedSink {
    file: File,
    path: PathBuf,
    limit: u64,
    written: u64,
    truncated: bool,
}

impl BoundedSink {
    /// Create (or truncate) the destination file and wrap it in a sink
    /// that accepts at most `limit` bytes.
    pub async fn create(path: &Path, limit: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(path).await?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            limit,
            written: 0,
            truncated: false,
        })
    }

    /// Append a chunk. Bytes past the limit are dropped and the sink is
    /// marked truncated; writes after that point are no-ops.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if self.truncated || chunk.is_empty() {
            return Ok(());
        }
        let remaining = self.limit.saturating_sub(self.written);
        if remaining == 0 {
            self.truncated = true;
            return Ok(());
        }
        let take = chunk.len().min(remaining as usize);
        self.file.write_all(&chunk[..take]).await?;
        self.written += take as u64;
        if take < chunk.len() {
            self.truncated = true;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.file.flush().await?;
        Ok(())
    }

    /// Whether any bytes were dropped.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Bytes actually written to the file.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
