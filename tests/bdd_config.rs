//! Behavioural tests for duttest configuration.
//!
//! These tests validate the configuration defaults and cross-field
//! validation using rstest-bdd.

// Test-specific lint exceptions: expect is standard practice in tests
#![expect(clippy::expect_used, reason = "expect is standard practice in tests")]

use camino::Utf8PathBuf;
use duttest::config::{AppConfig, ConnectConfig, DevserverConfig, ReportConfig, RunnerDataConfig};
use duttest::error::{ConfigError, DutTestError};
use rstest::fixture;
use rstest_bdd::Slot;
use rstest_bdd_macros::{ScenarioState, given, scenario, then, when};

/// State shared across configuration test scenarios.
#[derive(Default, ScenarioState)]
struct ConfigState {
    /// The configuration under test.
    config: Slot<AppConfig>,
    /// The outcome of calling `AppConfig::validate`.
    validation: Slot<Result<(), String>>,
}

/// Fixture providing a fresh configuration state.
#[fixture]
fn config_state() -> ConfigState {
    ConfigState::default()
}

/// Extracts the configuration from state with consistent error handling.
fn get_config(config_state: &ConfigState) -> AppConfig {
    config_state
        .config
        .get()
        .expect("configuration should be set")
}

#[given("no configuration is provided")]
fn no_configuration_provided(config_state: &ConfigState) {
    let mut config = AppConfig::default();
    // `post_merge` normally fills these in; replicate it for a bare default.
    config.result_root = AppConfig::default_result_root();
    config.heartbeat_interval_secs = 60;
    config_state.config.set(config);
}

#[given("a target without a runner path")]
fn target_without_runner_path(config_state: &ConfigState) {
    let config = AppConfig {
        target: Some("root@dut.local".to_owned()),
        runner_path: None,
        ..AppConfig::default()
    };
    config_state.config.set(config);
}

#[given("a target with a runner path")]
fn target_with_runner_path(config_state: &ConfigState) {
    let config = AppConfig {
        target: Some("root@dut.local".to_owned()),
        runner_path: Some(Utf8PathBuf::from("/usr/local/bin/duttest-runner")),
        ..AppConfig::default()
    };
    config_state.config.set(config);
}

#[given("no target and no runner path")]
fn no_target_no_runner_path(config_state: &ConfigState) {
    config_state.config.set(AppConfig::default());
}

#[given("connect tuning of {timeout} second timeout and {retries} retries")]
fn connect_tuning(config_state: &ConfigState, timeout: u64, retries: u32) {
    let config = AppConfig {
        connect: ConnectConfig {
            connect_timeout_secs: timeout,
            retries,
            ..ConnectConfig::default()
        },
        ..AppConfig::default()
    };
    config_state.config.set(config);
}

#[given("a runner configuration with kill_stale disabled")]
fn runner_config_kill_stale_disabled(config_state: &ConfigState) {
    let config = AppConfig {
        runner: RunnerDataConfig {
            kill_stale: false,
            ..RunnerDataConfig::default()
        },
        ..AppConfig::default()
    };
    config_state.config.set(config);
}

#[given("a report address of {address}")]
fn report_address(config_state: &ConfigState, address: String) {
    let config = AppConfig {
        report: ReportConfig {
            address: Some(address),
        },
        ..AppConfig::default()
    };
    config_state.config.set(config);
}

#[given("a devserver bind address of {addr}")]
fn devserver_bind_address(config_state: &ConfigState, addr: String) {
    let config = AppConfig {
        devserver: DevserverConfig {
            bind_addr: addr,
            ..DevserverConfig::default()
        },
        ..AppConfig::default()
    };
    config_state.config.set(config);
}

#[when("the configuration is validated")]
fn configuration_is_validated(config_state: &ConfigState) {
    let config = get_config(config_state);
    let outcome = config.validate().map_err(|error| error.to_string());
    config_state.validation.set(outcome);
}

#[then("the result root is {root}")]
fn result_root_is(config_state: &ConfigState, root: String) {
    let config = get_config(config_state);
    assert_eq!(config.result_root.as_str(), root.as_str());
}

#[then("the heartbeat interval is {seconds} seconds")]
fn heartbeat_interval_is(config_state: &ConfigState, seconds: u64) {
    let config = get_config(config_state);
    assert_eq!(config.heartbeat_interval_secs, seconds);
}

#[then("no target is configured")]
fn no_target_configured(config_state: &ConfigState) {
    let config = get_config(config_state);
    assert!(config.target.is_none());
}

#[then("validation succeeds")]
#[expect(clippy::expect_used, reason = "test step - panics are acceptable")]
fn validation_succeeds(config_state: &ConfigState) {
    let outcome = config_state
        .validation
        .get()
        .expect("validation outcome should be set");
    assert!(outcome.is_ok(), "expected validation to succeed: {outcome:?}");
}

#[then("validation fails mentioning {field}")]
#[expect(clippy::expect_used, reason = "test step - panics are acceptable")]
fn validation_fails_mentioning(config_state: &ConfigState, field: String) {
    let outcome = config_state
        .validation
        .get()
        .expect("validation outcome should be set");
    let message = outcome.expect_err("expected validation to fail");
    assert!(
        message.contains(&field),
        "expected validation error to mention '{field}', got: {message}"
    );
}

#[then("the connect timeout is {seconds} seconds")]
fn connect_timeout_is(config_state: &ConfigState, seconds: u64) {
    let config = get_config(config_state);
    assert_eq!(config.connect.connect_timeout_secs, seconds);
}

#[then("the connect retry count is {count}")]
fn connect_retry_count_is(config_state: &ConfigState, count: u32) {
    let config = get_config(config_state);
    assert_eq!(config.connect.retries, count);
}

#[then("kill_stale is disabled")]
fn kill_stale_is_disabled(config_state: &ConfigState) {
    let config = get_config(config_state);
    assert!(!config.runner.kill_stale);
}

#[then("the report address is {address}")]
fn report_address_is(config_state: &ConfigState, address: String) {
    let config = get_config(config_state);
    assert_eq!(config.report.address.as_deref(), Some(address.as_str()));
}

#[then("the devserver bind address is {addr}")]
fn devserver_bind_address_is(config_state: &ConfigState, addr: String) {
    let config = get_config(config_state);
    assert_eq!(config.devserver.bind_addr, addr);
}

/// Confirms the error taxonomy, not just its rendered message.
#[then("the validation error is a missing-field configuration error")]
fn validation_error_is_missing_field(config_state: &ConfigState) {
    let config = get_config(config_state);
    let error = config.validate().expect_err("expected validation to fail");
    assert!(matches!(
        error,
        DutTestError::Config(ConfigError::MissingRequired { .. })
    ));
}

// Scenario bindings

#[scenario(
    path = "tests/features/configuration.feature",
    name = "Default configuration values"
)]
fn default_configuration_values(config_state: ConfigState) {
    let _ = config_state;
}

#[scenario(
    path = "tests/features/configuration.feature",
    name = "A target without a runner path fails validation"
)]
fn target_without_runner_path_fails(config_state: ConfigState) {
    let _ = config_state;
}

#[scenario(
    path = "tests/features/configuration.feature",
    name = "A target with a runner path passes validation"
)]
fn target_with_runner_path_passes(config_state: ConfigState) {
    let _ = config_state;
}

#[scenario(
    path = "tests/features/configuration.feature",
    name = "A host-only run with no target passes validation"
)]
fn host_only_run_passes(config_state: ConfigState) {
    let _ = config_state;
}

#[scenario(
    path = "tests/features/configuration.feature",
    name = "Connect tuning overrides the defaults"
)]
fn connect_tuning_overrides_defaults(config_state: ConfigState) {
    let _ = config_state;
}

#[scenario(
    path = "tests/features/configuration.feature",
    name = "Runner data configuration overrides kill_stale"
)]
fn runner_data_config_overrides_kill_stale(config_state: ConfigState) {
    let _ = config_state;
}

#[scenario(
    path = "tests/features/configuration.feature",
    name = "Report configuration enables result forwarding"
)]
fn report_config_enables_forwarding(config_state: ConfigState) {
    let _ = config_state;
}

#[scenario(
    path = "tests/features/configuration.feature",
    name = "Devserver bind address overrides the default"
)]
fn devserver_bind_address_overrides_default(config_state: ConfigState) {
    let _ = config_state;
}
