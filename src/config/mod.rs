//! Configuration system for duttest.
//!
//! This module provides the configuration structures and CLI definitions for the
//! duttest application. Configuration loading and precedence merging is handled by
//! the `ortho_config` crate. Intended precedence: CLI flags override environment
//! variables, which override configuration files, which override defaults.
//!
//! The configuration file is expected at `~/.config/duttest/config.toml` by default.
//!
//! # Example Configuration
//!
//! ```toml
//! target = "root@dut.local:22"
//! runner_path = "/usr/local/bin/duttest-runner"
//! result_root = "./results"
//! heartbeat_interval_secs = 60
//!
//! [connect]
//! connect_timeout_secs = 10
//! retries = 2
//!
//! [runner]
//! bundle_glob = ["*.bundle"]
//! data_dir = "/usr/local/duttest/data"
//!
//! [devserver]
//! bind_addr = "127.0.0.1:0"
//! allowed_buckets = ["my-staging-bucket"]
//! ```

mod cli;
mod types;

#[cfg(test)]
mod tests;

pub use cli::{Cli, CollectSysinfoArgs, Commands, ListArgs, RunArgs};
pub use types::{
    AppConfig, ConnectConfig, DevserverConfig, RebootConfig, ReportConfig, RunnerDataConfig,
};

pub use loader::{env_var_names, load_config};

mod loader;
