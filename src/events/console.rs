//! Handler (a): prints a colorized one-line status per finalized entity and
//! relays run/entity log lines to `tracing`.

use colored::Colorize;

use crate::error::DutTestError;
use crate::result::EntityResult;

use super::{Handler, HandlerFuture};

/// Prints a colorized pass/fail/skip line per entity and forwards log lines
/// to the `tracing` subscriber at `info`/`warn` level.
#[derive(Debug, Default)]
pub struct ConsoleLogger;

impl ConsoleLogger {
    /// Creates a new logger.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn status_line(result: &EntityResult) -> String {
        if result.skipped() {
            format!("{} {}", "SKIP".yellow().bold(), result.name)
        } else if result.passed() {
            format!("{} {}", "PASS".green().bold(), result.name)
        } else {
            format!("{} {}", "FAIL".red().bold(), result.name)
        }
    }
}

impl Handler for ConsoleLogger {
    fn name(&self) -> &'static str {
        "console_logger"
    }

    fn on_run_log<'a>(&'a mut self, _time_ms: i64, text: &'a str) -> HandlerFuture<'a> {
        tracing::info!(target: "duttest::run", "{text}");
        Box::pin(async { Ok::<(), DutTestError>(()) })
    }

    fn on_entity_log<'a>(
        &'a mut self,
        _time_ms: i64,
        entity_name: &'a str,
        text: &'a str,
    ) -> HandlerFuture<'a> {
        tracing::info!(target: "duttest::entity", entity = entity_name, "{text}");
        Box::pin(async { Ok(()) })
    }

    fn on_entity_error<'a>(
        &'a mut self,
        _time_ms: i64,
        entity_name: &'a str,
        reason: &'a str,
        file: &'a str,
        line: u32,
    ) -> HandlerFuture<'a> {
        tracing::warn!(target: "duttest::entity", entity = entity_name, file, line, "{reason}");
        Box::pin(async { Ok(()) })
    }

    #[expect(clippy::print_stdout, reason = "the console logger's whole job is printing status lines")]
    fn on_entity_end<'a>(&'a mut self, result: &'a EntityResult) -> HandlerFuture<'a> {
        println!("{}", Self::status_line(result));
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn status_line_reports_pass_for_clean_completed_result() {
        let mut result = EntityResult::started("pkg.Ok", Utc::now());
        result.end = Some(Utc::now());
        let line = ConsoleLogger::status_line(&result);
        assert!(line.contains("pkg.Ok"));
    }

    #[test]
    fn status_line_reports_skip_when_skip_reasons_present() {
        let mut result = EntityResult::started("pkg.Skipped", Utc::now());
        result.skip_reasons.push("missing dependency: x".to_owned());
        let line = ConsoleLogger::status_line(&result);
        assert!(line.contains("pkg.Skipped"));
    }
}
