//! The event processor: dispatches a run's [`ControlMessage`] stream to an
//! ordered chain of handlers.
//!
//! Handlers run in registration order. The first handler to return an error
//! aborts the run: no further events are dispatched to any handler, every
//! handler's `on_run_end` is invoked exactly once with that error, and the
//! caller is expected to close the bundle stream.

pub mod console;
pub mod copier;
pub mod fulllog;
pub mod jsonl;
pub mod junit;
pub mod report;
pub mod snapshot;

use std::future::Future;
use std::pin::Pin;

use crate::error::{DutTestError, EventsError};
use crate::protocol::ControlMessage;

/// A boxed future returned by every [`Handler`] method.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), DutTestError>> + Send + 'a>>;

/// A participant in the event-processor handler chain.
///
/// Every method defaults to a no-op so handlers only implement what they
/// care about. Methods take `&mut self`: handlers are not expected to be
/// shared across concurrent runs.
pub trait Handler: Send {
    /// A name used in diagnostics (e.g. [`EventsError::HandlerAborted`]).
    fn name(&self) -> &'static str;

    /// Called once at the start of a run.
    fn on_run_start<'a>(&'a mut self, _time_ms: i64, _entity_names: &'a [String]) -> HandlerFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    /// A run-scoped log line.
    fn on_run_log<'a>(&'a mut self, _time_ms: i64, _text: &'a str) -> HandlerFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    /// A run-scoped error that does not itself end the run.
    fn on_run_error<'a>(&'a mut self, _time_ms: i64, _reason: &'a str) -> HandlerFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    /// The first event for an entity.
    fn on_entity_start<'a>(&'a mut self, _time_ms: i64, _entity_name: &'a str) -> HandlerFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    /// An informational log line scoped to one entity.
    fn on_entity_log<'a>(
        &'a mut self,
        _time_ms: i64,
        _entity_name: &'a str,
        _text: &'a str,
    ) -> HandlerFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    /// An error recorded against one entity that does not itself end it.
    fn on_entity_error<'a>(
        &'a mut self,
        _time_ms: i64,
        _entity_name: &'a str,
        _reason: &'a str,
        _file: &'a str,
        _line: u32,
    ) -> HandlerFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    /// The last event for an entity, carrying its finalized result.
    fn on_entity_end<'a>(&'a mut self, _result: &'a crate::result::EntityResult) -> HandlerFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    /// Signals that the bundle has finished copying an entity's output
    /// files off its side.
    fn on_entity_copy_end<'a>(&'a mut self, _time_ms: i64, _entity_name: &'a str) -> HandlerFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    /// Called exactly once, whether the run ended cleanly or was aborted by
    /// a handler error or a fatal protocol condition.
    fn on_run_end<'a>(&'a mut self, _error: Option<&'a DutTestError>) -> HandlerFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}

/// Drives a [`ControlMessage`] stream through a fixed chain of handlers.
pub struct EventProcessor {
    handlers: Vec<Box<dyn Handler>>,
    /// Per-entity in-progress results, keyed by entity name, built up from
    /// `EntityStart`/`EntityLog`/`EntityError` until `EntityEnd` finalizes
    /// and removes the entry.
    in_progress: std::collections::BTreeMap<String, crate::result::EntityResult>,
}

impl EventProcessor {
    /// Creates a processor with `handlers` invoked in the given order.
    #[must_use]
    pub fn new(handlers: Vec<Box<dyn Handler>>) -> Self {
        Self {
            handlers,
            in_progress: std::collections::BTreeMap::new(),
        }
    }

    /// Processes a single message, updating in-progress entity state and
    /// dispatching to every handler in order.
    ///
    /// # Errors
    ///
    /// Returns the first handler error encountered. The caller must treat
    /// this as fatal: no further messages should be dispatched.
    pub async fn dispatch(&mut self, message: &ControlMessage) -> Result<(), DutTestError> {
        match message {
            ControlMessage::RunStart { time_ms, entity_names } => {
                for handler in &mut self.handlers {
                    let name = handler.name();
                    abort_on_err(name, handler.on_run_start(*time_ms, entity_names).await)?;
                }
                Ok(())
            }
            ControlMessage::RunLog { time_ms, text } => {
                for handler in &mut self.handlers {
                    let name = handler.name();
                    abort_on_err(name, handler.on_run_log(*time_ms, text).await)?;
                }
                Ok(())
            }
            ControlMessage::RunError { time_ms, reason } => {
                for handler in &mut self.handlers {
                    let name = handler.name();
                    abort_on_err(name, handler.on_run_error(*time_ms, reason).await)?;
                }
                Ok(())
            }
            ControlMessage::RunEnd { .. } => Ok(()),
            ControlMessage::EntityStart { time_ms, entity_name } => {
                let now = chrono::Utc::now();
                self.in_progress.insert(
                    entity_name.clone(),
                    crate::result::EntityResult::started(entity_name.clone(), now),
                );
                for handler in &mut self.handlers {
                    let name = handler.name();
                    abort_on_err(name, handler.on_entity_start(*time_ms, entity_name).await)?;
                }
                Ok(())
            }
            ControlMessage::EntityLog {
                time_ms,
                entity_name,
                text,
            } => {
                for handler in &mut self.handlers {
                    let name = handler.name();
                    abort_on_err(name, handler.on_entity_log(*time_ms, entity_name, text).await)?;
                }
                Ok(())
            }
            ControlMessage::EntityError {
                time_ms,
                entity_name,
                reason,
                file,
                line,
            } => {
                if let Some(result) = self.in_progress.get_mut(entity_name) {
                    result.errors.push(crate::result::SerializedError {
                        reason: reason.clone(),
                        file: file.clone(),
                        line: *line,
                        stack: None,
                    });
                }
                for handler in &mut self.handlers {
                    let name = handler.name();
                    abort_on_err(
                        name,
                        handler
                            .on_entity_error(*time_ms, entity_name, reason, file, *line)
                            .await,
                    )?;
                }
                Ok(())
            }
            ControlMessage::EntityEnd {
                entity_name,
                skip_reasons,
                timing_log,
                ..
            } => {
                let mut result = self.in_progress.remove(entity_name).unwrap_or_else(|| {
                    crate::result::EntityResult::started(entity_name.clone(), chrono::Utc::now())
                });
                result.end = Some(chrono::Utc::now());
                result.skip_reasons = skip_reasons.clone();
                result.timing = timing_log.clone();
                for handler in &mut self.handlers {
                    let name = handler.name();
                    abort_on_err(name, handler.on_entity_end(&result).await)?;
                }
                Ok(())
            }
            ControlMessage::EntityCopyEnd { time_ms, entity_name } => {
                for handler in &mut self.handlers {
                    let name = handler.name();
                    abort_on_err(name, handler.on_entity_copy_end(*time_ms, entity_name).await)?;
                }
                Ok(())
            }
            ControlMessage::Heartbeat { .. }
            | ControlMessage::StackOperation { .. }
            | ControlMessage::StackOperationResponse { .. } => Ok(()),
        }
    }

    /// Calls `on_run_end` on every handler exactly once, with `error` (if
    /// any) passed to each.
    pub async fn finish(&mut self, error: Option<&DutTestError>) {
        for handler in &mut self.handlers {
            let name = handler.name();
            if let Err(e) = handler.on_run_end(error).await {
                tracing::warn!(handler = name, error = %e, "on_run_end handler failed");
            }
        }
    }
}

/// Wraps a handler's result as a [`DutTestError::Events`] abort, tagging it
/// with the handler's name.
fn abort_on_err(handler: &'static str, result: Result<(), DutTestError>) -> Result<(), DutTestError> {
    result.map_err(|error| {
        DutTestError::Events(EventsError::HandlerAborted {
            handler: handler.to_owned(),
            message: error.to_string(),
        })
    })
}
