//! Layer precedence tests for `MergeComposer` config composition.

use ortho_config::MergeComposer;
use ortho_config::serde_json::json;
use rstest::rstest;

use crate::config::AppConfig;
use crate::config::tests::helpers::{
    assert_config_has_defaults, create_composer_with_defaults, create_composer_with_file_and_env,
    merge_config,
};

/// Test that serialised `AppConfig::default()` can round-trip through `MergeComposer`.
///
/// This mirrors the production `load_config` behaviour, which serialises
/// `AppConfig::default()` as the defaults layer.
#[rstest]
fn layer_precedence_serialised_defaults_round_trip() {
    let composer = create_composer_with_defaults().expect("composer creation should succeed");
    let config = merge_config(composer).expect("merge should succeed");
    let expected = AppConfig::default();

    assert_eq!(config.target, expected.target);
    assert_eq!(config.runner_path, expected.runner_path);
    assert_eq!(config.result_root, expected.result_root);
    assert_eq!(
        config.heartbeat_interval_secs,
        expected.heartbeat_interval_secs
    );
    assert_eq!(
        config.connect.connect_timeout_secs,
        expected.connect.connect_timeout_secs
    );
    assert_eq!(config.runner.kill_stale, expected.runner.kill_stale);
}

/// Test that defaults layer provides baseline configuration values.
#[rstest]
fn layer_precedence_defaults_provide_baseline() {
    let composer = create_composer_with_defaults().expect("composer creation should succeed");
    let config = merge_config(composer).expect("merge should succeed");

    assert_config_has_defaults(&config);
}

/// Test that file layer overrides defaults.
#[rstest]
fn layer_precedence_file_overrides_defaults() {
    let mut composer = create_composer_with_defaults().expect("composer creation should succeed");
    composer.push_file(
        json!({
            "target": "root@from-file",
            "result_root": "/from/file"
        }),
        None,
    );

    let config = merge_config(composer).expect("merge should succeed");

    assert_eq!(config.target.as_deref(), Some("root@from-file"));
    assert_eq!(config.result_root.as_str(), "/from/file");
}

/// Test that environment layer overrides file layer.
#[rstest]
fn layer_precedence_env_overrides_file() {
    let composer = create_composer_with_file_and_env().expect("composer creation should succeed");
    let config = merge_config(composer).expect("merge should succeed");

    // Environment overrides file for target
    assert_eq!(config.target.as_deref(), Some("root@from-env"));
    // File value preserved for result_root (not in env layer)
    assert_eq!(config.result_root.as_str(), "/from/file");
}

/// Test that CLI layer overrides all other layers.
#[rstest]
fn layer_precedence_cli_overrides_all() {
    let mut composer =
        create_composer_with_file_and_env().expect("composer creation should succeed");
    composer.push_cli(json!({
        "target": "root@from-cli"
    }));

    let config = merge_config(composer).expect("merge should succeed");

    // CLI overrides everything for target
    assert_eq!(config.target.as_deref(), Some("root@from-cli"));
    // File value preserved for result_root (not in env or CLI layers)
    assert_eq!(config.result_root.as_str(), "/from/file");
}

/// Test full precedence chain: defaults < file < env < CLI.
#[rstest]
fn layer_precedence_full_chain() {
    let mut composer = create_composer_with_defaults().expect("composer creation should succeed");

    // Layer 2: File provides base configuration
    composer.push_file(
        json!({
            "target": "file-target",
            "result_root": "file-root",
            "connect": { "retries": 5 },
            "runner": { "kill_stale": false }
        }),
        None,
    );

    // Layer 3: Environment overrides some values
    composer.push_environment(json!({
        "result_root": "env-root",
        "connect": { "retries": 9, "connect_timeout_secs": 20 }
    }));

    // Layer 4: CLI overrides the highest priority values
    composer.push_cli(json!({
        "target": "cli-target"
    }));

    let config = merge_config(composer).expect("merge should succeed");

    // CLI wins for target
    assert_eq!(config.target.as_deref(), Some("cli-target"));
    // Env wins for result_root
    assert_eq!(config.result_root.as_str(), "env-root");
    // File wins for runner.kill_stale (not overridden by higher layers)
    assert!(!config.runner.kill_stale);
    // Env wins for connect.retries (higher than file, no CLI override)
    assert_eq!(config.connect.retries, 9);
    // Env provides connect.connect_timeout_secs
    assert_eq!(config.connect.connect_timeout_secs, 20);
}

/// Test that nested config merges correctly across layers.
#[rstest]
fn layer_precedence_nested_config_merges() {
    let mut composer = create_composer_with_defaults().expect("composer creation should succeed");
    composer.push_file(
        json!({
            "connect": {
                "retries": 7,
                "retry_interval_secs": 1
            }
        }),
        None,
    );
    composer.push_environment(json!({
        "connect": {
            "retries": 3
        }
    }));

    let config = merge_config(composer).expect("merge should succeed");

    // Environment overrides file for retries
    assert_eq!(config.connect.retries, 3);
    // File value preserved for retry_interval_secs (not in env layer)
    assert_eq!(config.connect.retry_interval_secs, 1);
}

/// Test that missing layers result in defaults being used.
#[rstest]
fn layer_precedence_empty_layers_use_defaults() {
    let mut composer = create_composer_with_defaults().expect("composer creation should succeed");
    // Add empty override layers (no effect on values)
    composer.push_file(json!({}), None);
    composer.push_environment(json!({}));
    composer.push_cli(json!({}));

    let config = merge_config(composer).expect("merge should succeed");

    assert_config_has_defaults(&config);
}

/// Test that empty JSON defaults do NOT work - serialised `AppConfig::default()` is required.
///
/// This test verifies that using `push_defaults(json!({}))` fails to produce a valid
/// configuration. OrthoConfig requires fully-specified defaults from the serialized
/// `AppConfig::default()` value. Empty JSON would result in null/missing fields that
/// cannot be deserialized into the target struct.
///
/// This documents why the production loader MUST use the serialized defaults approach
/// rather than relying on serde's `#[serde(default)]` during deserialization.
#[rstest]
fn layer_precedence_empty_json_defaults_fails() {
    // Empty JSON defaults should fail to produce a valid config.
    let mut empty_composer = MergeComposer::new();
    empty_composer.push_defaults(json!({}));

    let result = AppConfig::merge_from_layers(empty_composer.layers());

    // The merge should fail because empty JSON doesn't provide required defaults.
    assert!(
        result.is_err(),
        "empty JSON defaults should fail; production MUST serialize AppConfig::default()"
    );
}

/// Test that serialised `AppConfig::default()` works correctly as a defaults layer.
///
/// This is the correct approach used by the production `load_config` function.
/// Contrast with `layer_precedence_empty_json_defaults_fails` which demonstrates
/// that empty JSON does NOT work.
#[rstest]
fn layer_precedence_serialised_defaults_works() {
    // Production approach: serialise AppConfig::default() as the defaults layer.
    let composer = create_composer_with_defaults().expect("composer creation should succeed");
    let config = merge_config(composer).expect("merge should succeed");

    // Verify the config matches the expected defaults.
    assert_config_has_defaults(&config);
}
