//! Shared fixtures and helper functions for config tests.

use std::sync::Arc;

use ortho_config::MergeComposer;
use rstest::fixture;

use crate::config::AppConfig;

/// Fixture providing an `AppConfig` parsed from a full TOML example.
#[fixture]
pub fn app_config_from_full_toml() -> AppConfig {
    let toml = r#"
        target = "root@dut.local:22"
        runner_path = "/usr/local/bin/duttest-runner"
        result_root = "/tmp/results"
        heartbeat_interval_secs = 30

        [connect]
        connect_timeout_secs = 5
        retries = 4

        [runner]
        bundle_glob = ["*.bundle", "*.test"]
        data_dir = "/srv/duttest/data"
        kill_stale = false

        [devserver]
        bind_addr = "127.0.0.1:8080"
        allowed_buckets = ["staging"]
    "#;

    toml::from_str(toml).expect("TOML parsing should succeed")
}

/// Fixture providing an `AppConfig` parsed from a minimal TOML example.
#[fixture]
pub fn app_config_from_partial_toml() -> AppConfig {
    let toml = r#"
        target = "root@dut.local"
    "#;

    toml::from_str(toml).expect("TOML parsing should succeed")
}

/// Helper: Creates a `MergeComposer` with defaults layer already pushed.
pub fn create_composer_with_defaults() -> Result<MergeComposer, serde_json::Error> {
    let mut composer = MergeComposer::new();
    let defaults = ortho_config::serde_json::to_value(AppConfig::default())?;
    composer.push_defaults(defaults);
    Ok(composer)
}

/// Helper: Merges layers from a composer into `AppConfig`.
pub fn merge_config(composer: MergeComposer) -> Result<AppConfig, Arc<ortho_config::OrthoError>> {
    AppConfig::merge_from_layers(composer.layers())
}

/// Helper: Asserts that a config has all default values.
pub fn assert_config_has_defaults(config: &AppConfig) {
    assert!(config.target.is_none(), "target should be None");
    assert!(config.runner_path.is_none(), "runner_path should be None");
    assert_eq!(
        config.result_root.as_str(),
        "./results",
        "result_root should default to ./results"
    );
    assert_eq!(
        config.heartbeat_interval_secs, 60,
        "heartbeat_interval_secs should default to 60"
    );
    assert_eq!(
        config.connect.connect_timeout_secs, 10,
        "connect.connect_timeout_secs should default to 10"
    );
    assert_eq!(config.connect.retries, 2, "connect.retries should default to 2");
    assert!(
        config.runner.kill_stale,
        "runner.kill_stale should default to true"
    );
}

/// Helper: Creates a `MergeComposer` with defaults, file, and env layers for testing layer precedence.
///
/// This builder pattern reduces duplication in tests that verify environment and CLI layer
/// precedence by providing pre-configured file and environment layers.
pub fn create_composer_with_file_and_env() -> Result<MergeComposer, serde_json::Error> {
    use ortho_config::serde_json::json;

    let mut composer = create_composer_with_defaults()?;

    // Standard file layer for precedence tests
    composer.push_file(
        json!({
            "target": "root@from-file",
            "result_root": "/from/file"
        }),
        None,
    );

    // Standard environment layer for precedence tests
    composer.push_environment(json!({
        "target": "root@from-env"
    }));

    Ok(composer)
}
