//! Configuration data types for duttest.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use ortho_config::{OrthoConfig, OrthoResult, PostMergeContext, PostMergeHook};
use serde::{Deserialize, Serialize};

/// Connection-cache tuning: how hard and how long to try reaching the DUT.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Per-attempt connect timeout, in seconds.
    pub connect_timeout_secs: u64,
    /// Number of retries after the first attempt.
    pub retries: u32,
    /// Delay between retries, in seconds.
    pub retry_interval_secs: u64,
    /// Path to the private key file used for authentication.
    pub key_file: Option<Utf8PathBuf>,
    /// Directory to search for additional keys.
    pub key_dir: Option<Utf8PathBuf>,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            retries: 2,
            retry_interval_secs: 2,
            key_file: None,
            key_dir: None,
        }
    }
}

/// Reboot-watch tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RebootConfig {
    /// Total time budget for a reboot to complete, in seconds.
    pub timeout_secs: u64,
    /// Delay between reconnect polls, in seconds.
    pub poll_interval_secs: u64,
}

impl Default for RebootConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 240,
            poll_interval_secs: 3,
        }
    }
}

/// The runner's own data-driven static configuration (§4.2), loaded with the
/// same layered precedence as the driver when the runner is invoked as a
/// standalone binary, or constructed in-process for embedding.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RunnerDataConfig {
    /// Glob patterns matching bundle executables.
    pub bundle_glob: Vec<String>,
    /// Directory holding test data files.
    pub data_dir: Utf8PathBuf,
    /// Directory for scratch/temp files.
    pub tmp_dir: Utf8PathBuf,
    /// Directory containing system logs to snapshot and diff.
    pub syslog_dir: Utf8PathBuf,
    /// Subpaths under `syslog_dir` excluded from snapshotting.
    pub syslog_exclude: Vec<Utf8PathBuf>,
    /// Subdirectory name for exported unified system logs.
    pub unified_syslog_subdir: String,
    /// Names of known system crash directories.
    pub crash_dirs: Vec<String>,
    /// Path to a file whose presence signals a sibling process to pause log
    /// rotation.
    pub pause_rotation_file: Option<Utf8PathBuf>,
    /// Path to the `KEY=VALUE` release-description file.
    pub release_file: Option<Utf8PathBuf>,
    /// Path to the newline-delimited USE-flag file.
    pub use_flags_file: Option<Utf8PathBuf>,
    /// Map from high-level feature name to a boolean expression over USE
    /// flags and autodetected tags.
    pub feature_gates: BTreeMap<String, String>,
    /// Whether to kill sibling runner processes sharing this basename on
    /// startup, oldest PID first.
    pub kill_stale: bool,
    /// Per-executable cap on copied crash dumps.
    pub crash_dump_cap: usize,
}

impl Default for RunnerDataConfig {
    fn default() -> Self {
        Self {
            bundle_glob: vec!["*.bundle".to_owned()],
            data_dir: Utf8PathBuf::from("/usr/local/duttest/data"),
            tmp_dir: Utf8PathBuf::from("/tmp/duttest"),
            syslog_dir: Utf8PathBuf::from("/var/log"),
            syslog_exclude: Vec::new(),
            unified_syslog_subdir: "unified".to_owned(),
            crash_dirs: vec![
                "/var/spool/crash".to_owned(),
                "/home/chronos/crash".to_owned(),
            ],
            pause_rotation_file: None,
            release_file: Some(Utf8PathBuf::from("/etc/lsb-release")),
            use_flags_file: None,
            feature_gates: BTreeMap::new(),
            kill_stale: true,
            crash_dump_cap: 3,
        }
    }
}

/// The ephemeral devserver shim's configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DevserverConfig {
    /// Address to bind the proxy to (`host:port`, port `0` for ephemeral).
    pub bind_addr: String,
    /// Bucket name prefixes allowed through the proxy.
    pub allowed_buckets: Vec<String>,
}

impl Default for DevserverConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_owned(),
            allowed_buckets: Vec::new(),
        }
    }
}

/// Report-RPC client configuration; absent means results are not forwarded.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ReportConfig {
    /// The report server address, if result forwarding is enabled.
    pub address: Option<String>,
}

/// Root application configuration.
///
/// Loaded with layered precedence via `OrthoConfig`: struct defaults,
/// `duttest.toml` (XDG-discovered or pointed to by `DUTTEST_CONFIG_PATH`),
/// `DUTTEST_*` environment variables, then CLI flags win.
#[derive(Debug, Clone, Default, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(
    prefix = "DUTTEST",
    post_merge_hook,
    discovery(
        app_name = "duttest",
        env_var = "DUTTEST_CONFIG_PATH",
        config_file_name = "config.toml",
        dotfile_name = ".duttest.toml",
        config_cli_long = "config",
        config_cli_visible = true,
    )
)]
pub struct AppConfig {
    /// The `[user@]host[:port]` DUT target; absent for host-only runs.
    pub target: Option<String>,

    /// Path to the runner executable, local or on the DUT.
    pub runner_path: Option<Utf8PathBuf>,

    /// Root directory under which this run's result tree is written.
    pub result_root: Utf8PathBuf,

    /// Minimum interval, in seconds, at which a bundle must emit a
    /// heartbeat before it is considered stalled.
    pub heartbeat_interval_secs: u64,

    /// Connection-cache tuning.
    #[serde(default)]
    #[ortho_config(skip_cli)]
    pub connect: ConnectConfig,

    /// Reboot-watch tuning.
    #[serde(default)]
    #[ortho_config(skip_cli)]
    pub reboot: RebootConfig,

    /// The runner's own static configuration.
    #[serde(default)]
    #[ortho_config(skip_cli)]
    pub runner: RunnerDataConfig,

    /// The ephemeral devserver shim's configuration.
    #[serde(default)]
    #[ortho_config(skip_cli)]
    pub devserver: DevserverConfig,

    /// Report-RPC client configuration.
    #[serde(default)]
    #[ortho_config(skip_cli)]
    pub report: ReportConfig,
}

impl AppConfig {
    /// Validates cross-field invariants not expressible as plain defaults:
    /// a DUT target must be paired with a runner path, since there is
    /// nothing to execute against without one.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ConfigError::MissingRequired`] if `target`
    /// is set but `runner_path` is not.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.target.is_some() && self.runner_path.is_none() {
            return Err(crate::error::ConfigError::MissingRequired {
                field: "runner_path".to_owned(),
            }
            .into());
        }
        Ok(())
    }
}

fn default_result_root() -> Utf8PathBuf {
    Utf8PathBuf::from("./results")
}

impl AppConfig {
    /// The result-root default used when a field-level default is needed
    /// outside of `#[derive(Default)]` (e.g. building a config by hand in
    /// tests).
    #[must_use]
    pub fn default_result_root() -> Utf8PathBuf {
        default_result_root()
    }
}

impl PostMergeHook for AppConfig {
    fn post_merge(&mut self, _ctx: &PostMergeContext) -> OrthoResult<()> {
        if self.result_root.as_str().is_empty() {
            self.result_root = default_result_root();
        }
        if self.heartbeat_interval_secs == 0 {
            self.heartbeat_interval_secs = 60;
        }
        Ok(())
    }
}
