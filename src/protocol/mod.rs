//! Control-message wire schema: a self-delimiting, newline-terminated JSON
//! tagged union exchanged between a bundle and its runner, and again
//! between the runner and the driver.
//!
//! Decoders tolerate and ignore unknown fields (`#[serde(deny_unknown_fields)]`
//! is deliberately never applied here); encoders omit `None` fields rather
//! than emitting `null`, except where the schema models nullability
//! explicitly (`timing_log`).

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::ProtocolError;
use crate::timing::StageSnapshot;

/// A single control message exchanged over the stdio hop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    /// Emitted once at the start of a run.
    RunStart {
        /// Device-local timestamp, milliseconds since the Unix epoch.
        time_ms: i64,
        /// Names of every entity scheduled to run.
        entity_names: Vec<String>,
    },
    /// A run-scoped (not entity-scoped) log line.
    RunLog {
        /// Device-local timestamp.
        time_ms: i64,
        /// The log text.
        text: String,
    },
    /// A run-scoped error; does not itself end the run.
    RunError {
        /// Device-local timestamp.
        time_ms: i64,
        /// The error reason.
        reason: String,
    },
    /// Emitted once at the end of a run.
    RunEnd {
        /// Device-local timestamp.
        time_ms: i64,
        /// A terse error summary if the run failed fatally.
        error: Option<String>,
    },
    /// The first event for a given entity.
    EntityStart {
        /// Device-local timestamp.
        time_ms: i64,
        /// The entity's name.
        entity_name: String,
    },
    /// An informational log line scoped to one entity.
    EntityLog {
        /// Device-local timestamp.
        time_ms: i64,
        /// The entity's name.
        entity_name: String,
        /// The log text.
        text: String,
    },
    /// An error recorded against one entity; does not itself end it.
    EntityError {
        /// Device-local timestamp.
        time_ms: i64,
        /// The entity's name.
        entity_name: String,
        /// The error reason.
        reason: String,
        /// The source file where the error was recorded.
        file: String,
        /// The line where the error was recorded.
        line: u32,
    },
    /// The last event for a given entity (absent if the bundle crashed
    /// mid-entity).
    EntityEnd {
        /// Device-local timestamp.
        time_ms: i64,
        /// The entity's name.
        entity_name: String,
        /// Skip reasons, if the entity was skipped rather than run.
        skip_reasons: Vec<String>,
        /// This entity's timing subtree, if timing was collected.
        timing_log: Option<StageSnapshot>,
    },
    /// Signals that the bundle has finished copying an entity's output
    /// files into its intermediate output directory.
    EntityCopyEnd {
        /// Device-local timestamp.
        time_ms: i64,
        /// The entity's name.
        entity_name: String,
    },
    /// A liveness token; requires no reply.
    Heartbeat {
        /// Device-local timestamp.
        time_ms: i64,
    },
    /// A request from the bundle to manipulate a fixture living in another
    /// tier.
    StackOperation {
        /// Device-local timestamp.
        time_ms: i64,
        /// A unique identifier correlating this request with its response.
        request_id: String,
        /// The fixture name targeted by this operation.
        fixture_name: String,
        /// The requested operation.
        operation: StackOperationKind,
    },
    /// The driver's reply to a `StackOperation` request.
    StackOperationResponse {
        /// The `request_id` this reply corresponds to.
        request_id: String,
        /// An error reason, if the operation failed.
        error: Option<String>,
    },
}

/// The kind of stack manipulation requested by a `StackOperation` message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StackOperationKind {
    /// Push the named fixture.
    Push,
    /// Pop the named fixture.
    Pop,
    /// Mark the named fixture dirty.
    SetDirty,
    /// Query whether the named fixture is usable.
    Status,
}

impl ControlMessage {
    /// Encodes this message as a single line (including the trailing
    /// newline) ready to be written to a stdio pipe.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] if serialization fails, which
    /// should not happen for well-formed values of this enum.
    pub fn encode_line(&self) -> Result<String, ProtocolError> {
        let mut line = serde_json::to_string(self).map_err(|e| ProtocolError::Malformed {
            message: e.to_string(),
        })?;
        line.push('\n');
        Ok(line)
    }

    /// Decodes a single line (without its trailing newline) as a control
    /// message.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] if `line` is not valid JSON or
    /// does not match any known variant.
    pub fn decode_line(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line).map_err(|e| ProtocolError::Malformed {
            message: e.to_string(),
        })
    }
}

/// Writes a single control message, holding an exclusive lock on the
/// underlying writer for the duration of the write so that concurrent
/// writers can never interleave partial lines.
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] on encode failure, or propagates
/// the underlying I/O error wrapped the same way.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &ControlMessage,
) -> Result<(), ProtocolError> {
    let line = message.encode_line()?;
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| ProtocolError::Malformed {
            message: format!("write failed: {e}"),
        })?;
    Ok(())
}

/// A line-oriented reader over a control-message stream.
pub struct MessageReader<R> {
    lines: tokio::io::Lines<BufReader<R>>,
}

impl<R: tokio::io::AsyncRead + Unpin> MessageReader<R> {
    /// Wraps `reader` for line-delimited control-message decoding.
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Reads and decodes the next message, or `Ok(None)` at EOF.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] if a line is not valid JSON or
    /// the underlying read fails.
    pub async fn next_message(&mut self) -> Result<Option<ControlMessage>, ProtocolError> {
        let Some(line) = self
            .lines
            .next_line()
            .await
            .map_err(|e| ProtocolError::Malformed {
                message: format!("read failed: {e}"),
            })?
        else {
            return Ok(None);
        };
        ControlMessage::decode_line(&line).map(Some)
    }
}

/// Validates per-entity ordering: at most one `EntityStart`, followed by
/// any number of `EntityLog`/`EntityError`, followed by at most one
/// `EntityEnd`.
#[derive(Debug, Default)]
pub struct EntityOrderTracker {
    started: bool,
    ended: bool,
}

impl EntityOrderTracker {
    /// Creates a fresh tracker for one entity.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Observes `message`, returning an error if it violates ordering.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::OutOfOrder`] on a duplicate `EntityStart`, a
    /// log/error before start, or any message after `EntityEnd`.
    pub fn observe(&mut self, message: &ControlMessage) -> Result<(), ProtocolError> {
        if self.ended {
            return Err(ProtocolError::OutOfOrder {
                message: "message received after EntityEnd".to_owned(),
            });
        }
        match message {
            ControlMessage::EntityStart { .. } => {
                if self.started {
                    return Err(ProtocolError::OutOfOrder {
                        message: "duplicate EntityStart".to_owned(),
                    });
                }
                self.started = true;
            }
            ControlMessage::EntityEnd { .. } => {
                if !self.started {
                    return Err(ProtocolError::OutOfOrder {
                        message: "EntityEnd before EntityStart".to_owned(),
                    });
                }
                self.ended = true;
            }
            ControlMessage::EntityLog { .. } | ControlMessage::EntityError { .. } => {
                if !self.started {
                    return Err(ProtocolError::OutOfOrder {
                        message: "entity log/error before EntityStart".to_owned(),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }
}
