//! Behavioural tests for the duttest CLI.
//!
//! These tests validate the command-line interface behaviour using rstest-bdd.

// Test-specific lint exceptions: expect and unwrap are standard practice in tests
#![expect(clippy::expect_used, reason = "expect is standard practice in tests")]
#![expect(
    clippy::str_to_string,
    reason = "String conversion clarity is more important than micro-optimization in tests"
)]

use clap::{CommandFactory, Parser};
use duttest::config::Cli;
use rstest::fixture;
use rstest_bdd::Slot;
use rstest_bdd_macros::{ScenarioState, given, scenario, then};

/// State shared across CLI test scenarios.
#[derive(Default, ScenarioState)]
struct CliState {
    /// The output from running the CLI.
    output: Slot<String>,
    /// Any error message from the CLI.
    error: Slot<String>,
    /// Whether the CLI invocation succeeded.
    success: Slot<bool>,
}

/// Fixture providing a fresh CLI state.
#[fixture]
fn cli_state() -> CliState {
    CliState::default()
}

// Step definitions

#[given("the CLI is invoked with --help")]
fn invoke_with_help(cli_state: &CliState) {
    let mut cmd = Cli::command();
    let help_text = cmd.render_help().to_string();
    cli_state.output.set(help_text);
    cli_state.success.set(true);
}

#[given("the CLI is invoked with --version")]
fn invoke_with_version(cli_state: &CliState) {
    let cmd = Cli::command();
    let version = cmd.get_version().unwrap_or("unknown").to_string();
    let name = cmd.get_name();
    cli_state.output.set(format!("{name} {version}"));
    cli_state.success.set(true);
}

#[given("the CLI is invoked with run")]
fn invoke_run_without_args(cli_state: &CliState) {
    let result: Result<Cli, clap::Error> = Cli::try_parse_from(["duttest", "run"]);
    match result {
        Ok(_) => {
            cli_state.success.set(true);
        }
        Err(e) => {
            cli_state.error.set(e.to_string());
            cli_state.success.set(false);
        }
    }
}

#[given("the CLI is invoked with reboot")]
fn invoke_reboot_without_args(cli_state: &CliState) {
    let result: Result<Cli, clap::Error> = Cli::try_parse_from(["duttest", "reboot"]);
    match result {
        Ok(_) => {
            cli_state.success.set(true);
        }
        Err(e) => {
            cli_state.error.set(e.to_string());
            cli_state.success.set(false);
        }
    }
}

#[given("the CLI is invoked with collect-sysinfo without --dest")]
fn invoke_collect_sysinfo_without_dest(cli_state: &CliState) {
    let result: Result<Cli, clap::Error> = Cli::try_parse_from(["duttest", "collect-sysinfo"]);
    match result {
        Ok(_) => {
            cli_state.success.set(true);
        }
        Err(e) => {
            cli_state.error.set(e.to_string());
            cli_state.success.set(false);
        }
    }
}

#[given("the CLI is invoked with collect-sysinfo --dest /tmp/out")]
fn invoke_collect_sysinfo_with_dest(cli_state: &CliState) {
    let result: Result<Cli, clap::Error> =
        Cli::try_parse_from(["duttest", "collect-sysinfo", "--dest", "/tmp/out"]);
    match result {
        Ok(_) => {
            cli_state.success.set(true);
        }
        Err(e) => {
            cli_state.error.set(e.to_string());
            cli_state.success.set(false);
        }
    }
}

#[then("the output contains {text}")]
fn output_contains(cli_state: &CliState, text: String) {
    let output = cli_state
        .output
        .get()
        .expect("output should be set before checking");
    assert!(
        output.contains(&text),
        "Expected output to contain '{text}', but got:\n{output}"
    );
}

#[then("an error is returned")]
fn error_is_returned(cli_state: &CliState) {
    let success = cli_state
        .success
        .get()
        .expect("success should be set before checking");
    assert!(!success, "Expected an error to be returned");
}

#[then("the invocation succeeds")]
fn invocation_succeeds(cli_state: &CliState) {
    let success = cli_state
        .success
        .get()
        .expect("success should be set before checking");
    assert!(success, "Expected the invocation to succeed");
}

#[then("the error mentions --dest")]
fn error_mentions_dest(cli_state: &CliState) {
    let error = cli_state
        .error
        .get()
        .expect("error should be set before checking");
    assert!(
        error.contains("--dest"),
        "Expected error to mention '--dest', but got:\n{error}"
    );
}

// Scenario bindings

#[scenario(path = "tests/features/cli.feature", name = "Display help information")]
fn display_help_information(cli_state: CliState) {
    let _ = cli_state;
}

#[scenario(
    path = "tests/features/cli.feature",
    name = "Display version information"
)]
fn display_version_information(cli_state: CliState) {
    let _ = cli_state;
}

#[scenario(
    path = "tests/features/cli.feature",
    name = "Run command is accepted without flags"
)]
fn run_is_accepted_without_flags(cli_state: CliState) {
    let _ = cli_state;
}

#[scenario(
    path = "tests/features/cli.feature",
    name = "Collect-sysinfo requires a destination"
)]
fn collect_sysinfo_requires_destination(cli_state: CliState) {
    let _ = cli_state;
}

#[scenario(
    path = "tests/features/cli.feature",
    name = "Collect-sysinfo is accepted with a destination"
)]
fn collect_sysinfo_accepted_with_destination(cli_state: CliState) {
    let _ = cli_state;
}

#[scenario(
    path = "tests/features/cli.feature",
    name = "Reboot command is accepted without flags"
)]
fn reboot_is_accepted_without_flags(cli_state: CliState) {
    let _ = cli_state;
}
