//! Handler (f): re-emits the full in-memory result set as `results.json`
//! once the run ends.

use camino::Utf8PathBuf;

use crate::error::{DutTestError, FilesystemError};
use crate::result::EntityResult;

use super::{Handler, HandlerFuture};

/// Writes a single `results.json` array containing every finalized result,
/// in the order they were finalized.
pub struct ResultsSnapshot {
    path: Utf8PathBuf,
    results: Vec<EntityResult>,
}

impl ResultsSnapshot {
    /// Creates a snapshot writer that will serialize to `path` on
    /// `on_run_end`.
    #[must_use]
    pub fn new(path: Utf8PathBuf) -> Self {
        Self {
            path,
            results: Vec::new(),
        }
    }
}

impl Handler for ResultsSnapshot {
    fn name(&self) -> &'static str {
        "results_snapshot"
    }

    fn on_entity_end<'a>(&'a mut self, result: &'a EntityResult) -> HandlerFuture<'a> {
        self.results.push(result.clone());
        Box::pin(async { Ok(()) })
    }

    fn on_run_end<'a>(&'a mut self, _error: Option<&'a DutTestError>) -> HandlerFuture<'a> {
        Box::pin(async move {
            let json = serde_json::to_vec_pretty(&self.results).map_err(|e| {
                DutTestError::Filesystem(FilesystemError::IoError {
                    path: self.path.clone().into_std_path_buf(),
                    message: e.to_string(),
                })
            })?;
            tokio::fs::write(&self.path, json).await.map_err(|e| {
                DutTestError::Filesystem(FilesystemError::IoError {
                    path: self.path.clone().into_std_path_buf(),
                    message: e.to_string(),
                })
            })
        })
    }
}
