//! Shared result types: per-entity runtime records and final results.

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorRecord;
use crate::timing::StageSnapshot;

/// The runtime-only record that accompanies a live entity while it runs.
#[derive(Debug, Clone)]
pub struct EntityInfo {
    /// When the entity started.
    pub start: DateTime<Utc>,
    /// This entity's output directory, a direct child of the run's `out` dir.
    pub out_dir: Utf8PathBuf,
    /// Final destination directory in the host result tree.
    pub final_dir: Utf8PathBuf,
}

/// A single serialized error attached to a finalized result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SerializedError {
    /// The human-readable reason.
    pub reason: String,
    /// Source file where the error was recorded.
    pub file: String,
    /// Line number where the error was recorded.
    pub line: u32,
    /// A formatted stack trace, if captured.
    pub stack: Option<String>,
}

impl From<&ErrorRecord> for SerializedError {
    fn from(record: &ErrorRecord) -> Self {
        Self {
            reason: record.reason.clone(),
            file: record.site.file.to_owned(),
            line: record.site.line,
            stack: record.stack.clone(),
        }
    }
}

/// The finalized outcome of one entity's run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityResult {
    /// The entity's name.
    pub name: String,
    /// When it started, as an RFC 3339 timestamp.
    pub start: DateTime<Utc>,
    /// When it ended, as an RFC 3339 timestamp, if it completed.
    pub end: Option<DateTime<Utc>>,
    /// Errors recorded during the run, in occurrence order.
    pub errors: Vec<SerializedError>,
    /// Skip reasons, if this entity was skipped rather than run.
    pub skip_reasons: Vec<String>,
    /// This entity's timing subtree.
    pub timing: Option<StageSnapshot>,
}

impl EntityResult {
    /// Creates a fresh, not-yet-ended result for `name`.
    #[must_use]
    pub fn started(name: impl Into<String>, start: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            start,
            end: None,
            errors: Vec::new(),
            skip_reasons: Vec::new(),
            timing: None,
        }
    }

    /// Whether this result represents a passing entity: it ended, has no
    /// errors, and was not skipped.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.end.is_some() && self.errors.is_empty() && self.skip_reasons.is_empty()
    }

    /// Whether this result represents a skip.
    #[must_use]
    pub fn skipped(&self) -> bool {
        !self.skip_reasons.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn fresh_result_is_neither_passed_nor_skipped() {
        let result = EntityResult::started("pkg.Ok", Utc::now());
        assert!(!result.passed());
        assert!(!result.skipped());
    }

    #[rstest]
    fn ended_result_with_no_errors_and_no_skips_passed() {
        let mut result = EntityResult::started("pkg.Ok", Utc::now());
        result.end = Some(Utc::now());
        assert!(result.passed());
    }

    #[rstest]
    fn skip_reason_marks_result_skipped() {
        let mut result = EntityResult::started("pkg.NeedsX", Utc::now());
        result.skip_reasons.push("missing dependency: X".to_owned());
        assert!(result.skipped());
        assert!(!result.passed());
    }
}
