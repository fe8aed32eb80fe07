//! Runner client: spawn a test-runner subprocess (local, or over SSH) and
//! establish one bidirectional byte stream to it.
//!
//! The runner itself is also shippable as its own binary entry point; that
//! side of the contract — argv parsing, static config loading, bundle
//! discovery and the control-message relay up its own stdout — lives in the
//! `duttest-runner` embedding a caller builds around this crate, not here.
//! This module owns the driver's half: spawning the process and feeding it
//! its handshake.

use std::collections::BTreeMap;
use std::process::Stdio;

use camino::Utf8PathBuf;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::connection::Target;
use crate::error::RunnerError;

/// The mode selector passed as the runner's first positional argument and
/// echoed in the `Args` handshake object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunnerMode {
    /// Run selected tests to completion.
    RunTests,
    /// List the entities a selection would run, without running them.
    ListTests,
    /// Fetch the current on-DUT system-info snapshot state.
    GetSysInfoState,
    /// Collect diffed system logs and new crash dumps.
    CollectSysInfo,
    /// Fetch static DUT information (release description, capabilities).
    GetDutInfo,
    /// Open the bundle gRPC tier over this runner's stdio.
    Rpc,
}

impl RunnerMode {
    /// The argv token identifying this mode, per the runner's positional
    /// calling convention.
    #[must_use]
    pub fn as_arg(self) -> &'static str {
        match self {
            Self::RunTests => "run-tests",
            Self::ListTests => "list-tests",
            Self::GetSysInfoState => "get-sysinfo-state",
            Self::CollectSysInfo => "collect-sysinfo",
            Self::GetDutInfo => "get-dut-info",
            Self::Rpc => "rpc",
        }
    }
}

/// The JSON document streamed onto the runner's stdin immediately after
/// spawn, specifying the operation and its parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Args {
    /// The requested operation.
    pub mode: RunnerMode,
    /// This run's identifier, shared with the result directory name.
    pub run_id: String,
    /// A boolean dependency expression further restricting selection.
    pub filter: Option<String>,
    /// Entities explicitly selected, if the caller pre-resolved a list.
    #[serde(default)]
    pub entity_names: Vec<String>,
    /// Feature names the bundle should treat as available.
    #[serde(default)]
    pub features: Vec<String>,
    /// Free-form test variables passed through to entities.
    #[serde(default)]
    pub test_vars: BTreeMap<String, String>,
    /// This shard's index.
    #[serde(default)]
    pub shard_index: u32,
    /// The total number of shards.
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
    /// Whether nested fixture setup is permitted.
    #[serde(default)]
    pub recursive: bool,
    /// Destination directory for [`RunnerMode::CollectSysInfo`]'s diffed
    /// output. Unused by every other mode.
    #[serde(default)]
    pub dest: Option<Utf8PathBuf>,
}

fn default_shard_count() -> u32 {
    1
}

impl Args {
    /// Builds a minimal `Args` for a non-sharded, non-recursive invocation.
    #[must_use]
    pub fn new(mode: RunnerMode, run_id: impl Into<String>) -> Self {
        Self {
            mode,
            run_id: run_id.into(),
            filter: None,
            entity_names: Vec::new(),
            features: Vec::new(),
            test_vars: BTreeMap::new(),
            shard_index: 0,
            shard_count: 1,
            recursive: false,
            dest: None,
        }
    }
}

/// How to invoke the runner executable.
#[derive(Debug, Clone)]
pub enum RunnerCommand {
    /// Run the executable directly on the host.
    Local(Utf8PathBuf),
    /// Run the executable on the DUT via the `ssh` binary, with an
    /// environment prefix (`env K=V ... <path>`).
    Ssh {
        /// The DUT target.
        target: Target,
        /// The runner executable path on the DUT.
        path: Utf8PathBuf,
        /// Environment variables forwarded ahead of the executable, e.g.
        /// proxy passthrough.
        env: BTreeMap<String, String>,
    },
}

impl RunnerCommand {
    fn build(&self, mode: RunnerMode, run_id: &str, filter: Option<&str>) -> Command {
        match self {
            Self::Local(path) => {
                let mut command = Command::new(path.as_std_path());
                command.arg(mode.as_arg()).arg(run_id);
                if let Some(filter) = filter {
                    command.arg(filter);
                }
                command
            }
            Self::Ssh { target, path, env } => {
                let mut command = Command::new("ssh");
                command
                    .arg("-p")
                    .arg(target.port.to_string())
                    .arg(format!("{}@{}", target.user, target.host))
                    .arg("env");
                for (key, value) in env {
                    command.arg(format!("{key}={value}"));
                }
                command.arg(path.as_str()).arg(mode.as_arg()).arg(run_id);
                if let Some(filter) = filter {
                    command.arg(filter);
                }
                command
            }
        }
    }
}

/// A live runner subprocess with its stdio pipes under our control.
pub struct RunnerProcess {
    child: Child,
}

impl RunnerProcess {
    /// Spawns the runner per `command`, streams `args` onto its stdin as a
    /// single JSON line, and leaves the pipes open for the lifetime of the
    /// operation.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::SpawnFailed`] if the process cannot be
    /// started, or [`RunnerError::HandshakeFailed`] if the `Args` document
    /// cannot be written.
    pub async fn spawn(command: &RunnerCommand, args: &Args) -> Result<Self, RunnerError> {
        let path_for_error = match command {
            RunnerCommand::Local(p) => p.clone(),
            RunnerCommand::Ssh { path, .. } => path.clone(),
        };

        let mut cmd = command.build(args.mode, &args.run_id, args.filter.as_deref());
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| RunnerError::SpawnFailed {
            path: path_for_error.clone().into_std_path_buf(),
            message: e.to_string(),
        })?;

        let payload = serde_json::to_vec(args).map_err(|e| RunnerError::HandshakeFailed {
            message: e.to_string(),
        })?;
        let stdin = child
            .stdin
            .as_mut()
            .ok_or_else(|| RunnerError::HandshakeFailed {
                message: "runner stdin not piped".to_owned(),
            })?;
        stdin
            .write_all(&payload)
            .await
            .map_err(|e| RunnerError::HandshakeFailed {
                message: e.to_string(),
            })?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| RunnerError::HandshakeFailed {
                message: e.to_string(),
            })?;

        Ok(Self { child })
    }

    /// Reads the runner's entire stdout and decodes it as the JSON result
    /// document (for modes other than [`RunnerMode::Rpc`]).
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::UnexpectedExit`] if stdout cannot be read or
    /// does not decode as `T`.
    pub async fn read_json_result<T: DeserializeOwned>(&mut self) -> Result<T, RunnerError> {
        let stdout = self
            .child
            .stdout
            .as_mut()
            .ok_or_else(|| RunnerError::UnexpectedExit {
                status: "unknown".to_owned(),
                message: "runner stdout not piped".to_owned(),
            })?;
        let mut buf = Vec::new();
        stdout
            .read_to_end(&mut buf)
            .await
            .map_err(|e| RunnerError::UnexpectedExit {
                status: "unknown".to_owned(),
                message: e.to_string(),
            })?;
        serde_json::from_slice(&buf).map_err(|e| RunnerError::UnexpectedExit {
            status: "unknown".to_owned(),
            message: format!("result did not decode: {e}"),
        })
    }

    /// Takes ownership of the stdin/stdout pipes for [`RunnerMode::Rpc`],
    /// consuming `self`. The caller drives these as a duplex byte stream for
    /// the bundle gRPC tier.
    ///
    /// # Panics
    ///
    /// Panics if the pipes were not configured as piped at spawn time; this
    /// cannot happen via [`Self::spawn`].
    #[must_use]
    #[expect(
        clippy::expect_used,
        reason = "stdin/stdout are always piped by Self::spawn; a None here is a constructor bug, not a runtime condition"
    )]
    pub fn into_stdio(mut self) -> (ChildStdin, ChildStdout) {
        let stdin = self.child.stdin.take().expect("stdin piped at spawn");
        let stdout = self.child.stdout.take().expect("stdout piped at spawn");
        (stdin, stdout)
    }

    /// Waits for the process to exit, capturing stderr for diagnostics on
    /// non-zero exit.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::UnexpectedExit`] if the process exits with a
    /// non-success status.
    pub async fn wait(mut self) -> Result<(), RunnerError> {
        let mut stderr_text = String::new();
        if let Some(mut stderr) = self.child.stderr.take() {
            let _ignored = stderr.read_to_string(&mut stderr_text).await;
        }
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| RunnerError::UnexpectedExit {
                status: "unknown".to_owned(),
                message: e.to_string(),
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(RunnerError::UnexpectedExit {
                status: status.to_string(),
                message: stderr_text,
            })
        }
    }
}

/// Whether the executable at `/proc/<pid>/exe` has the given basename.
/// Visible for testing; the real scan lives in [`kill_stale_siblings`].
fn exe_basename(pid: u32) -> Option<String> {
    std::fs::read_link(format!("/proc/{pid}/exe"))
        .ok()?
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}

/// Kills, oldest PID first, any process under `/proc` sharing `basename`
/// and not equal to the current process, to prevent a stuck predecessor
/// from holding file locks.
///
/// # Errors
///
/// Returns [`RunnerError::KillStaleFailed`] if a matching process could not
/// be signalled; processes found and killed before the failure are still
/// reported via the error's `pid` field for the first failure only.
pub fn kill_stale_siblings(basename: &str) -> Result<(), RunnerError> {
    let own_pid = std::process::id();
    let mut pids: Vec<u32> = Vec::new();

    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Ok(());
    };
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) else {
            continue;
        };
        if pid == own_pid {
            continue;
        }
        if exe_basename(pid).as_deref() == Some(basename) {
            pids.push(pid);
        }
    }
    pids.sort_unstable();

    for pid in pids {
        let status = std::process::Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .status()
            .map_err(|e| RunnerError::KillStaleFailed {
                pid,
                message: e.to_string(),
            })?;
        if !status.success() {
            return Err(RunnerError::KillStaleFailed {
                pid,
                message: format!("kill exited with {status}"),
            });
        }
    }
    Ok(())
}
