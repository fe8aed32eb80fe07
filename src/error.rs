//! Semantic error types for duttest.
//!
//! This module defines the error hierarchy for duttest, following the principle of
//! using semantic error enums (via `thiserror`) for conditions the caller might
//! inspect, retry, or map to an exit code, while reserving opaque errors
//! (`eyre::Report`) for the application boundary.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// The location at which an error was wrapped, captured via [`std::panic::Location`].
///
/// Mirrors the call-site-capturing semantics described for error records: every
/// `Wrap`/`Wrapf` keeps the file and line of its own call site so the full chain
/// can be reconstructed when the top-level error is formatted in verbose mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    /// Absolute or crate-relative source file of the call site.
    pub file: &'static str,
    /// Line number of the call site.
    pub line: u32,
}

impl std::fmt::Display for CallSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

impl CallSite {
    /// Captures the caller's location.
    #[must_use]
    #[track_caller]
    pub fn here() -> Self {
        let loc = std::panic::Location::caller();
        Self {
            file: loc.file(),
            line: loc.line(),
        }
    }
}

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found at the expected path.
    #[error("configuration file not found: {path}")]
    FileNotFound {
        /// The path where the configuration file was expected.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("failed to parse configuration file: {message}")]
    ParseError {
        /// A description of the parse error.
        message: String,
    },

    /// A required configuration value is missing.
    #[error("missing required configuration: {field}")]
    MissingRequired {
        /// The name of the missing field.
        field: String,
    },

    /// A configuration value failed validation.
    #[error("invalid configuration value for '{field}': {reason}")]
    InvalidValue {
        /// The name of the invalid field.
        field: String,
        /// The reason the value is invalid.
        reason: String,
    },

    /// The `OrthoConfig` library returned an error during configuration loading.
    #[error("configuration loading failed: {0}")]
    OrthoConfig(Arc<ortho_config::OrthoError>),
}

/// Errors that can occur while opening, probing, or tearing down a connection
/// to a device under test.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The target specification (`[user@]host[:port]`) could not be parsed.
    #[error("invalid target specification '{target}': {reason}")]
    InvalidTarget {
        /// The raw target string supplied.
        target: String,
        /// Why the target was rejected.
        reason: String,
    },

    /// Dialling the target failed after exhausting the configured retries.
    #[error("failed to connect to '{target}' after {attempts} attempt(s): {message}")]
    DialFailed {
        /// The target that could not be reached.
        target: String,
        /// The number of attempts made.
        attempts: u32,
        /// A description of the last failure.
        message: String,
    },

    /// A previously-healthy connection was found broken and must be
    /// reopened by the caller.
    #[error("connection to '{target}' is broken: {message}")]
    TargetBroken {
        /// The target whose connection broke.
        target: String,
        /// A description of the break.
        message: String,
    },

    /// A health probe exceeded its deadline.
    #[error("health check for '{target}' timed out after {seconds}s")]
    HealthCheckTimeout {
        /// The target being probed.
        target: String,
        /// The configured timeout, in seconds.
        seconds: u64,
    },

    /// A reboot was requested but the DUT did not come back within the
    /// configured timeout.
    #[error("reboot of '{target}' did not complete within {seconds}s: {reason}")]
    RebootTimedOut {
        /// The target being rebooted.
        target: String,
        /// The configured reboot timeout, in seconds.
        seconds: u64,
        /// Why the reboot was judged incomplete.
        reason: String,
    },
}

/// Errors that can occur while spawning or driving the runner subprocess.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The runner executable could not be spawned.
    #[error("failed to spawn runner '{path}': {message}")]
    SpawnFailed {
        /// The runner executable path.
        path: PathBuf,
        /// A description of the spawn failure.
        message: String,
    },

    /// The handshake `Args` document could not be written to the runner's stdin.
    #[error("failed to send runner handshake: {message}")]
    HandshakeFailed {
        /// A description of the handshake failure.
        message: String,
    },

    /// The runner exited before completing the requested operation.
    #[error("runner exited unexpectedly with status {status}: {message}")]
    UnexpectedExit {
        /// The process exit status, if known.
        status: String,
        /// Any trailing diagnostic text captured from stderr.
        message: String,
    },

    /// A sibling runner process could not be killed during kill-stale cleanup.
    #[error("failed to kill stale runner process {pid}: {message}")]
    KillStaleFailed {
        /// The process id that could not be killed.
        pid: u32,
        /// A description of the failure.
        message: String,
    },
}

/// Errors that can occur while driving the bundle RPC tier.
#[derive(Debug, Error)]
pub enum BundleError {
    /// Establishing the gRPC channel over the runner's stdio duplex failed.
    #[error("failed to connect to bundle: {message}")]
    ConnectFailed {
        /// A description of the connect failure.
        message: String,
    },

    /// The initial handshake with the bundle failed.
    #[error("bundle handshake failed: {message}")]
    HandshakeFailed {
        /// A description of the handshake failure.
        message: String,
    },

    /// The event stream was closed or violated the expected protocol.
    #[error("bundle protocol violation: {message}")]
    ProtocolViolation {
        /// A description of the violation.
        message: String,
    },

    /// A `StackOperation` request referenced a fixture ticket the driver
    /// does not recognise.
    #[error("unknown fixture ticket '{ticket}'")]
    UnknownTicket {
        /// The unrecognised ticket identifier.
        ticket: String,
    },

    /// A fixture was popped more times than it was pushed, or never popped.
    #[error("fixture '{name}' leaked: {reason}")]
    FixtureLeaked {
        /// The fixture name.
        name: String,
        /// Why this is considered a leak.
        reason: String,
    },

    /// Two consecutive heartbeats were missed.
    #[error("bundle '{bundle}' missed {count} consecutive heartbeats")]
    HeartbeatMissed {
        /// The bundle that stopped heartbeating.
        bundle: String,
        /// The number of consecutive misses observed.
        count: u32,
    },

    /// The underlying gRPC transport returned an error.
    #[error("bundle transport error: {0}")]
    Transport(#[from] tonic::Status),
}

/// Errors that can occur while managing the fixture stack.
#[derive(Debug, Error)]
pub enum FixtureError {
    /// A fixture's setup phase failed; its frame is now RED.
    #[error("fixture '{name}' failed to set up: {reason}")]
    SetupFailed {
        /// The fixture name.
        name: String,
        /// The setup failure reason.
        reason: String,
    },

    /// A fixture's reset phase failed after a dependent left it dirty.
    #[error("fixture '{name}' failed to reset: {reason}")]
    ResetFailed {
        /// The fixture name.
        name: String,
        /// The reset failure reason.
        reason: String,
    },

    /// A stack operation was attempted against an empty stack.
    #[error("fixture stack is empty")]
    StackEmpty,

    /// A pop was requested for a frame that is not on top of the stack.
    #[error("fixture '{name}' is not the top frame")]
    NotTopFrame {
        /// The fixture name that was requested.
        name: String,
    },
}

/// Errors raised while parsing or evaluating dependency expressions.
#[derive(Debug, Error)]
pub enum DependError {
    /// The expression text could not be parsed.
    #[error("invalid dependency expression '{expr}': {reason}")]
    ParseError {
        /// The offending expression text.
        expr: String,
        /// A description of the parse failure.
        reason: String,
    },

    /// The USE-flag file could not be read or contained an invalid line.
    #[error("invalid USE flag file '{path}': {reason}")]
    InvalidFlagFile {
        /// The flag file path.
        path: PathBuf,
        /// A description of the problem.
        reason: String,
    },
}

/// Errors raised while snapshotting or diffing on-device system state.
#[derive(Debug, Error)]
pub enum SysInfoError {
    /// Walking a log or crash directory failed.
    #[error("failed to walk '{path}': {message}")]
    WalkFailed {
        /// The directory that could not be walked.
        path: PathBuf,
        /// A description of the failure.
        message: String,
    },

    /// Copying diffed bytes or a new crash file failed.
    #[error("failed to copy '{path}': {message}")]
    CopyFailed {
        /// The path that could not be copied.
        path: PathBuf,
        /// A description of the failure.
        message: String,
    },
}

/// Errors raised by the safe-call sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The wrapped function did not return within `timeout + grace`.
    #[error("{name} did not return on timeout")]
    TimedOut {
        /// The name given to the sandboxed call.
        name: String,
    },

    /// The wrapped function panicked and the panic handler converted it
    /// to this error.
    #[error("{name} panicked: {message}")]
    Panicked {
        /// The name given to the sandboxed call.
        name: String,
        /// The panic payload, formatted as text.
        message: String,
    },

    /// The parent cancellation token fired before the call completed.
    #[error("{name} cancelled")]
    Cancelled {
        /// The name given to the sandboxed call.
        name: String,
    },
}

/// Errors raised by the control-message codec.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A line could not be decoded as a known control-message variant.
    #[error("malformed control message: {message}")]
    Malformed {
        /// A description of the decode failure.
        message: String,
    },

    /// A message arrived that violated ordering invariants (e.g. a second
    /// `EntityStart` for the same entity).
    #[error("protocol ordering violation: {message}")]
    OutOfOrder {
        /// A description of the violation.
        message: String,
    },
}

/// Errors that can occur during filesystem operations.
#[derive(Debug, Error)]
pub enum FilesystemError {
    /// A file or directory was not found.
    #[error("path not found: {path}")]
    NotFound {
        /// The path that was not found.
        path: PathBuf,
    },

    /// Permission denied when accessing a path.
    #[error("permission denied: {path}")]
    PermissionDenied {
        /// The path that could not be accessed.
        path: PathBuf,
    },

    /// An I/O error occurred.
    #[error("I/O error at '{path}': {message}")]
    IoError {
        /// The path where the error occurred.
        path: PathBuf,
        /// A description of the I/O error.
        message: String,
    },
}

/// Errors raised by the event-processor handler chain.
#[derive(Debug, Error)]
pub enum EventsError {
    /// The report-RPC service asked the driver to terminate the run.
    #[error("report service requested termination: {reason}")]
    ReportTerminateRequested {
        /// The reason given by the report service, if any.
        reason: String,
    },

    /// A handler could not write one of its output files.
    #[error("failed to write '{path}': {message}")]
    WriteFailed {
        /// The file the handler was writing.
        path: PathBuf,
        /// A description of the write failure.
        message: String,
    },

    /// A handler returned an error, aborting the run per the handler-chain
    /// invariant (first error wins, no further events dispatched).
    #[error("handler '{handler}' aborted the run: {message}")]
    HandlerAborted {
        /// The handler's name.
        handler: String,
        /// A description of the failure.
        message: String,
    },
}

/// A single error captured during a run, with its origin call site and
/// formatted stack trace.
///
/// This is the Rust analogue of the "error record" attached to an
/// `EntityResult`: it preserves enough provenance to render a chain back to
/// the point where the error first occurred.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    /// The human-readable reason.
    pub reason: String,
    /// Where the error was first recorded.
    pub site: CallSite,
    /// A formatted stack trace, if one was captured.
    pub stack: Option<String>,
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.reason, self.site)
    }
}

/// Top-level error type for the duttest application.
///
/// This enum aggregates all domain-specific errors into a single type that can
/// be used throughout the application. At the application boundary (main.rs),
/// these errors are typically converted to `eyre::Report` for human-readable
/// error reporting.
#[derive(Debug, Error)]
pub enum DutTestError {
    /// An error occurred during configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An error occurred while managing a connection to the device under test.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// An error occurred while driving the runner subprocess.
    #[error(transparent)]
    Runner(#[from] RunnerError),

    /// An error occurred while driving the bundle RPC tier.
    #[error(transparent)]
    Bundle(#[from] BundleError),

    /// An error occurred while managing the fixture stack.
    #[error(transparent)]
    Fixture(#[from] FixtureError),

    /// An error occurred while parsing or evaluating a dependency expression.
    #[error(transparent)]
    Depend(#[from] DependError),

    /// An error occurred while snapshotting or diffing system state.
    #[error(transparent)]
    SysInfo(#[from] SysInfoError),

    /// An error occurred inside the safe-call sandbox.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// An error occurred decoding or encoding a control message.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// An error occurred during filesystem operations.
    #[error(transparent)]
    Filesystem(#[from] FilesystemError),

    /// An error occurred in the event-processor handler chain.
    #[error(transparent)]
    Events(#[from] EventsError),

    /// The run aborted because an event handler, or the bundle stream
    /// itself, reported a fatal protocol violation.
    #[error("run aborted: {message}")]
    Fatal {
        /// A description of the fatal condition.
        message: String,
    },
}

/// A specialised `Result` type for duttest operations.
pub type Result<T> = std::result::Result<T, DutTestError>;
