//! Command-line argument definitions for duttest.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

/// Command-line interface for duttest.
#[derive(Debug, Parser)]
#[command(name = "duttest")]
#[command(
    author,
    version,
    about = "Integration-test orchestrator for a Linux-based embedded OS"
)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file.
    #[arg(long, global = true)]
    pub config: Option<Utf8PathBuf>,

    /// The `[user@]host[:port]` DUT target. Omit for host-only runs.
    #[arg(long, global = true)]
    pub target: Option<String>,

    /// Path to the runner executable, local or on the DUT.
    #[arg(long, global = true)]
    pub runner_path: Option<Utf8PathBuf>,

    /// Root directory under which this run's result tree is written.
    #[arg(long, global = true)]
    pub result_root: Option<Utf8PathBuf>,
}

/// Available subcommands, each driving the runner in a distinct mode.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run selected tests to completion, producing a full result tree.
    Run(RunArgs),

    /// List the entities a given selection would run, without running them.
    List(ListArgs),

    /// Fetch the current on-DUT system-info snapshot state.
    SysInfoState,

    /// Collect diffed system logs and new crash dumps into the result tree.
    CollectSysinfo(CollectSysinfoArgs),

    /// Fetch static information about the DUT (release description,
    /// capability set).
    DutInfo,

    /// Reboot the configured DUT target and wait for it to come back with a
    /// new boot identifier.
    Reboot,
}

/// Arguments for the `run` subcommand.
#[derive(Debug, Parser)]
pub struct RunArgs {
    /// A boolean dependency expression further restricting which entities
    /// run, beyond their own declared dependencies.
    #[arg(long)]
    pub filter: Option<String>,

    /// This shard's index, for splitting a suite across multiple invocations.
    #[arg(long, default_value_t = 0)]
    pub shard_index: u32,

    /// The total number of shards.
    #[arg(long, default_value_t = 1)]
    pub shard_count: u32,

    /// Whether fixtures may run recursively (a fixture itself depending on
    /// another fixture's setup).
    #[arg(long)]
    pub recursive: bool,
}

/// Arguments for the `list` subcommand.
#[derive(Debug, Parser)]
pub struct ListArgs {
    /// A boolean dependency expression restricting the listing.
    #[arg(long)]
    pub filter: Option<String>,
}

/// Arguments for the `collect-sysinfo` subcommand.
#[derive(Debug, Parser)]
pub struct CollectSysinfoArgs {
    /// Directory to write diffed logs and crash dumps into.
    #[arg(long, required = true)]
    pub dest: Utf8PathBuf,
}
