//! Handler: appends every run-scoped and entity-scoped log line and error
//! to `full.txt`, the complete driver log.

use camino::Utf8PathBuf;
use tokio::io::AsyncWriteExt;

use crate::error::{DutTestError, FilesystemError};

use super::{Handler, HandlerFuture};

/// Writes `full.txt`, the unabridged transcript of a run: every
/// `RunLog`/`EntityLog` line and every `RunError`/`EntityError` reason, in
/// arrival order.
pub struct FullLogWriter {
    path: Utf8PathBuf,
}

impl FullLogWriter {
    /// Creates a writer targeting `path`, created (or truncated) on first
    /// write.
    #[must_use]
    pub fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }

    fn io_error(&self, message: impl Into<String>) -> DutTestError {
        DutTestError::Filesystem(FilesystemError::IoError {
            path: self.path.clone().into_std_path_buf(),
            message: message.into(),
        })
    }

    async fn append(&self, line: &str) -> Result<(), DutTestError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_error(e.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| self.io_error(e.to_string()))?;
        file.write_all(b"\n").await.map_err(|e| self.io_error(e.to_string()))?;
        Ok(())
    }
}

impl Handler for FullLogWriter {
    fn name(&self) -> &'static str {
        "full_log_writer"
    }

    fn on_run_log<'a>(&'a mut self, time_ms: i64, text: &'a str) -> HandlerFuture<'a> {
        Box::pin(async move { self.append(&format!("[{time_ms}] {text}")).await })
    }

    fn on_run_error<'a>(&'a mut self, time_ms: i64, reason: &'a str) -> HandlerFuture<'a> {
        Box::pin(async move { self.append(&format!("[{time_ms}] ERROR {reason}")).await })
    }

    fn on_entity_log<'a>(
        &'a mut self,
        time_ms: i64,
        entity_name: &'a str,
        text: &'a str,
    ) -> HandlerFuture<'a> {
        Box::pin(async move { self.append(&format!("[{time_ms}] {entity_name}: {text}")).await })
    }

    fn on_entity_error<'a>(
        &'a mut self,
        time_ms: i64,
        entity_name: &'a str,
        reason: &'a str,
        file: &'a str,
        line: u32,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.append(&format!("[{time_ms}] {entity_name}: ERROR {reason} ({file}:{line})"))
                .await
        })
    }
}
