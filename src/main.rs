//! `duttest` application entry point.
//!
//! This binary is a thin CLI adapter over the `duttest` library: argument
//! parsing via Clap, configuration loading via the layered `OrthoConfig`
//! loader, and process exit code conversion. All orchestration lives in
//! [`duttest::driver`].
//!
//! Configuration is loaded with layered precedence:
//! 1. Application defaults
//! 2. Configuration file (`~/.config/duttest/config.toml` or
//!    `DUTTEST_CONFIG_PATH`)
//! 3. Environment variables (`DUTTEST_*`)
//! 4. Command-line arguments

use clap::Parser;
use duttest::config::{AppConfig, Cli, Commands, load_config};
use duttest::driver;
use duttest::error::{DutTestError, Result as DutTestResult};
use eyre::{Report, Result as EyreResult};

/// Application entry point.
///
/// Uses `eyre::Result` so configuration and orchestration failures print as
/// human-readable reports.
fn main() -> EyreResult<()> {
    let cli = Cli::parse();
    let config = load_config(&cli).map_err(Report::from)?;
    let runtime = create_runtime().map_err(Report::from)?;

    match runtime.block_on(run(&cli, &config)) {
        Ok(code) => std::process::exit(code),
        Err(error) => Err(Report::from(error)),
    }
}

/// Dispatches the parsed subcommand to the matching `driver` function,
/// returning the process exit code.
///
/// `config` has already passed [`AppConfig::validate`] (run by
/// [`load_config`]), so a missing `runner_path` surfaces here only if a
/// target-less, runner-less config somehow reaches a subcommand that needs
/// one; `driver::build_runner_command` catches that case too.
async fn run(cli: &Cli, config: &AppConfig) -> DutTestResult<i32> {
    match &cli.command {
        Commands::Run(args) => driver::run_tests(config, args).await,
        Commands::List(args) => driver::list_entities(config, args).await,
        Commands::SysInfoState => driver::sysinfo_state(config).await,
        Commands::CollectSysinfo(args) => driver::collect_sysinfo(config, args).await,
        Commands::DutInfo => driver::dut_info(config).await,
        Commands::Reboot => driver::reboot_dut(config).await,
    }
}

fn create_runtime() -> DutTestResult<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(|error| {
        DutTestError::Filesystem(duttest::error::FilesystemError::IoError {
            path: std::path::PathBuf::from("<tokio runtime>"),
            message: error.to_string(),
        })
    })
}
