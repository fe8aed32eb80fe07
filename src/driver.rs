//! The driver: wires configuration, the runner client, the bundle RPC tier,
//! and the event-processor handler chain into the operations exposed by the
//! CLI.
//!
//! Every function here returns the process exit code the caller should use
//! (0 success, 1 generic failure), per §6. Usage errors (exit code 2) are
//! caught earlier, at configuration validation; exit code 3 (staged
//! preconditions not met) is reserved for runner-side reporting this crate
//! relays verbatim rather than synthesizes.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use camino::Utf8PathBuf;

use crate::bundle::{self, BundleClient};
use crate::config::{AppConfig, CollectSysinfoArgs, ListArgs, RunArgs};
use crate::connection::reboot::{self, RebootOptions};
use crate::connection::ssh::RusshClient;
use crate::connection::{ConnCache, ConnectOptions, Target};
use crate::error::{BundleError, ConfigError, ConnectionError, DutTestError};
use crate::events::{EventProcessor, Handler};
use crate::events::console::ConsoleLogger;
use crate::events::copier::ArtifactCopier;
use crate::events::fulllog::FullLogWriter;
use crate::events::jsonl::JsonlWriter;
use crate::events::junit::JUnitWriter;
use crate::events::report::ReportClient;
use crate::events::snapshot::ResultsSnapshot;
use crate::protocol::{ControlMessage, StackOperationKind};
use crate::runner::{Args, RunnerCommand, RunnerMode, RunnerProcess};

const PROXY_ENV_VARS: &[&str] = &[
    "HTTP_PROXY", "http_proxy", "HTTPS_PROXY", "https_proxy", "NO_PROXY", "no_proxy",
];

/// Builds the command used to invoke the runner, per `config`: local if no
/// DUT target is configured, over `ssh` otherwise.
///
/// # Errors
///
/// Returns [`ConfigError::MissingRequired`] if a target is set without a
/// runner path (this should already be caught by [`AppConfig::validate`]),
/// or [`crate::error::ConnectionError`] if the target string cannot be
/// parsed.
fn build_runner_command(config: &AppConfig) -> Result<RunnerCommand, DutTestError> {
    let Some(runner_path) = config.runner_path.clone() else {
        return Err(DutTestError::Config(ConfigError::MissingRequired {
            field: "runner_path".to_owned(),
        }));
    };

    match &config.target {
        None => Ok(RunnerCommand::Local(runner_path)),
        Some(target_spec) => {
            let target = Target::parse(target_spec)?;
            let mut env = BTreeMap::new();
            for name in PROXY_ENV_VARS {
                if let Ok(value) = std::env::var(name) {
                    env.insert((*name).to_owned(), value);
                }
            }
            Ok(RunnerCommand::Ssh {
                target,
                path: runner_path,
                env,
            })
        }
    }
}

fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn connect_options(config: &AppConfig) -> ConnectOptions {
    ConnectOptions {
        connect_timeout: Duration::from_secs(config.connect.connect_timeout_secs),
        retries: config.connect.retries,
        retry_interval: Duration::from_secs(config.connect.retry_interval_secs),
        key_file: config.connect.key_file.clone(),
        key_dir: config.connect.key_dir.clone(),
    }
}

fn reboot_options(config: &AppConfig) -> RebootOptions {
    RebootOptions {
        timeout: Duration::from_secs(config.reboot.timeout_secs),
        poll_interval: Duration::from_secs(config.reboot.poll_interval_secs),
    }
}

/// Verifies the configured DUT target is reachable before a run begins,
/// running the best-effort diagnosis routine (§4.1) on failure to produce a
/// descriptive error. A no-op when no target is configured (host-only run).
///
/// # Errors
///
/// Returns [`DutTestError::Connection`] if the target is configured but
/// unreachable.
async fn ensure_dut_reachable(config: &AppConfig) -> Result<(), DutTestError> {
    let Some(target_spec) = config.target.as_ref() else {
        return Ok(());
    };
    let target = Target::parse(target_spec)?;
    let cache = ConnCache::new(RusshClient::new(), connect_options(config));

    if let Err(error) = cache.get(&target).await {
        let report = crate::connection::diagnosis::diagnose(&target.host, target.port).await;
        tracing::warn!(target = %target, diagnosis = %report.summary(), "DUT unreachable before run");
        return Err(DutTestError::Connection(ConnectionError::DialFailed {
            target: target.to_string(),
            attempts: config.connect.retries + 1,
            message: format!("{error}; diagnosis: {}", report.summary()),
        }));
    }
    Ok(())
}

/// Default handler chain for a `run` invocation: console logging, the two
/// always-on persisted artifacts, and the report client if configured.
fn build_handlers(config: &AppConfig, run_dir: &Utf8PathBuf) -> Vec<Box<dyn Handler>> {
    let mut handlers: Vec<Box<dyn Handler>> = vec![
        Box::new(ConsoleLogger::new()),
        Box::new(FullLogWriter::new(run_dir.join("full.txt"))),
        Box::new(JsonlWriter::new(run_dir.join("results.jsonl"))),
        Box::new(ArtifactCopier::new(
            config.runner.tmp_dir.clone(),
            run_dir.join("tests"),
        )),
        Box::new(JUnitWriter::new(run_dir.join("results.xml"))),
        Box::new(ResultsSnapshot::new(run_dir.join("results.json"))),
    ];
    if let Some(address) = config.report.address.clone() {
        handlers.push(Box::new(ReportClient::new(address)));
    }
    handlers
}

/// Creates `result_root/<run_id>` and repoints `result_root/latest` at it.
fn prepare_run_dir(config: &AppConfig, run_id: &str) -> Result<Utf8PathBuf, DutTestError> {
    let run_dir = config.result_root.join(run_id);
    std::fs::create_dir_all(&run_dir).map_err(|e| {
        DutTestError::Filesystem(crate::error::FilesystemError::IoError {
            path: run_dir.clone().into_std_path_buf(),
            message: e.to_string(),
        })
    })?;

    let latest = config.result_root.join("latest");
    let _ignored = std::fs::remove_file(&latest);
    #[cfg(unix)]
    {
        let _ignored = std::os::unix::fs::symlink(run_id, &latest);
    }

    Ok(run_dir)
}

/// Responds to a cross-tier `StackOperation` request.
///
/// This driver wires exactly one bundle connection per run, so there is no
/// second tier to forward a `Push`/`Pop` to; those are rejected outright.
/// `SetDirty`/`Status` against the (always-empty) local stack degrade to
/// "not usable", which callers treat as a skip rather than a hard failure.
async fn handle_stack_operation(
    session: &bundle::RunTestsSession,
    request_id: String,
    fixture_name: &str,
    operation: StackOperationKind,
) -> Result<(), BundleError> {
    let error = match operation {
        StackOperationKind::Push | StackOperationKind::Pop => Some(format!(
            "fixture '{fixture_name}' lives in another tier; cross-tier fixture forwarding is not configured for this run"
        )),
        StackOperationKind::SetDirty => None,
        StackOperationKind::Status => {
            Some(format!("fixture '{fixture_name}' is not usable: no cross-tier peer configured"))
        }
    };
    session.respond_stack_operation(request_id, error).await
}

/// Runs selected tests to completion and writes the full result tree under
/// `config.result_root`.
///
/// # Errors
///
/// Returns a [`DutTestError`] for any unrecoverable failure: runner spawn
/// failure, bundle connect/transport failure, or a missed-heartbeat
/// timeout.
pub async fn run_tests(config: &AppConfig, args: &RunArgs) -> Result<i32, DutTestError> {
    ensure_dut_reachable(config).await?;

    let run_id = new_run_id();
    let run_dir = prepare_run_dir(config, &run_id)?;

    let command = build_runner_command(config)?;
    let runner_args = Args {
        filter: args.filter.clone(),
        shard_index: args.shard_index,
        shard_count: args.shard_count,
        recursive: args.recursive,
        ..Args::new(RunnerMode::RunTests, run_id.clone())
    };
    let process = RunnerProcess::spawn(&command, &runner_args).await?;
    let (stdin, stdout) = process.into_stdio();
    let duplex = bundle::duplex::ChildDuplex::new(stdin, stdout);

    let mut client = BundleClient::connect(duplex).await?;
    let init = bundle::RunTestsInit {
        entity_names: Vec::new(),
        features: Vec::new(),
        test_vars: BTreeMap::new(),
        shard_index: args.shard_index,
        shard_count: args.shard_count,
        recursive: args.recursive,
        ..bundle::RunTestsInit::default()
    };
    let (session, mut events) = client.run_tests(init).await?;

    let mut processor = EventProcessor::new(build_handlers(config, &run_dir));
    let heartbeat_budget = Duration::from_secs(config.heartbeat_interval_secs.max(1) * 2);
    let mut missed_heartbeats: u32 = 0;
    let mut failed_entities: HashSet<String> = HashSet::new();
    let mut fatal: Option<DutTestError> = None;

    loop {
        let received = tokio::time::timeout(heartbeat_budget, events.recv()).await;
        let message = match received {
            Err(_elapsed) => {
                missed_heartbeats += 1;
                if missed_heartbeats >= 2 {
                    fatal = Some(DutTestError::Bundle(BundleError::HeartbeatMissed {
                        bundle: run_id.clone(),
                        count: missed_heartbeats,
                    }));
                    break;
                }
                continue;
            }
            Ok(None) => break,
            Ok(Some(Err(error))) => {
                fatal = Some(DutTestError::Bundle(error));
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        if matches!(message, ControlMessage::Heartbeat { .. }) {
            missed_heartbeats = 0;
        }

        if let ControlMessage::EntityError { ref entity_name, .. } = message {
            failed_entities.insert(entity_name.clone());
        }

        if let ControlMessage::StackOperation {
            ref request_id,
            ref fixture_name,
            operation,
            ..
        } = message
        {
            if let Err(error) =
                handle_stack_operation(&session, request_id.clone(), fixture_name, operation).await
            {
                fatal = Some(DutTestError::Bundle(error));
                break;
            }
        }

        if let Err(error) = processor.dispatch(&message).await {
            fatal = Some(error);
            break;
        }
    }

    processor.finish(fatal.as_ref()).await;

    if let Some(error) = fatal {
        return Err(error);
    }
    Ok(if failed_entities.is_empty() { 0 } else { 1 })
}

/// Lists the entities a selection would run, without running them.
///
/// # Errors
///
/// Returns a [`DutTestError`] if the runner cannot be spawned or its result
/// cannot be decoded.
pub async fn list_entities(config: &AppConfig, args: &ListArgs) -> Result<i32, DutTestError> {
    let command = build_runner_command(config)?;
    let runner_args = Args {
        filter: args.filter.clone(),
        ..Args::new(RunnerMode::ListTests, new_run_id())
    };
    let mut process = RunnerProcess::spawn(&command, &runner_args).await?;
    let entities: Vec<crate::entity::Entity> = process.read_json_result().await?;
    print_entity_names(&entities);
    process.wait().await?;
    Ok(0)
}

#[expect(clippy::print_stdout, reason = "listing entities is this command's entire output")]
fn print_entity_names(entities: &[crate::entity::Entity]) {
    for entity in entities {
        println!("{}", entity.name);
    }
}

/// Pretty-prints a JSON result to stdout.
///
/// `serde_json::Value` serialization cannot fail, so a formatting error here
/// would indicate a writer problem rather than a data problem; it is traced
/// rather than surfaced as a command failure.
#[expect(clippy::print_stdout, reason = "these commands' entire output is the JSON result")]
fn print_json_result(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(rendered) => println!("{rendered}"),
        Err(error) => tracing::error!("failed to render JSON result: {error}"),
    }
}

/// Fetches the current on-DUT system-info snapshot state and prints it.
///
/// # Errors
///
/// Returns a [`DutTestError`] if the runner cannot be spawned or its result
/// cannot be decoded.
pub async fn sysinfo_state(config: &AppConfig) -> Result<i32, DutTestError> {
    let command = build_runner_command(config)?;
    let runner_args = Args::new(RunnerMode::GetSysInfoState, new_run_id());
    let mut process = RunnerProcess::spawn(&command, &runner_args).await?;
    let state: serde_json::Value = process.read_json_result().await?;
    print_json_result(&state);
    process.wait().await?;
    Ok(0)
}

/// Collects diffed system logs and new crash dumps into `args.dest`.
///
/// `dest` is interpreted relative to wherever the runner executes: for a
/// local runner this is the driver's own filesystem; for an SSH-invoked
/// runner, the destination must already be reachable from the DUT side,
/// since this driver does not yet transfer files back over the connection.
///
/// # Errors
///
/// Returns a [`DutTestError`] if the runner cannot be spawned or exits
/// unsuccessfully.
pub async fn collect_sysinfo(
    config: &AppConfig,
    args: &CollectSysinfoArgs,
) -> Result<i32, DutTestError> {
    let command = build_runner_command(config)?;
    let runner_args = Args {
        dest: Some(args.dest.clone()),
        ..Args::new(RunnerMode::CollectSysInfo, new_run_id())
    };
    let mut process = RunnerProcess::spawn(&command, &runner_args).await?;
    let copied: serde_json::Value = process.read_json_result().await?;
    print_json_result(&copied);
    process.wait().await?;
    Ok(0)
}

/// Fetches static DUT information (release description, capability set).
///
/// # Errors
///
/// Returns a [`DutTestError`] if the runner cannot be spawned or its result
/// cannot be decoded.
pub async fn dut_info(config: &AppConfig) -> Result<i32, DutTestError> {
    let command = build_runner_command(config)?;
    let runner_args = Args::new(RunnerMode::GetDutInfo, new_run_id());
    let mut process = RunnerProcess::spawn(&command, &runner_args).await?;
    let info: serde_json::Value = process.read_json_result().await?;
    print_json_result(&info);
    process.wait().await?;
    Ok(0)
}

/// Reboots the configured DUT target and waits for it to come back with a
/// new boot identifier (§4.1 Reboot sequence).
///
/// # Errors
///
/// Returns [`ConfigError::MissingRequired`] if no target is configured, or
/// [`DutTestError::Connection`] if the reboot does not complete within the
/// configured timeout.
pub async fn reboot_dut(config: &AppConfig) -> Result<i32, DutTestError> {
    let Some(target_spec) = config.target.as_ref() else {
        return Err(DutTestError::Config(ConfigError::MissingRequired {
            field: "target".to_owned(),
        }));
    };
    let target = Target::parse(target_spec)?;
    let cache = ConnCache::new(RusshClient::new(), connect_options(config));

    reboot::reboot(&cache, &target, &reboot_options(config), None).await?;
    tracing::info!(target = %target, "DUT rebooted successfully");
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_runner_command_is_local_without_a_target() {
        let config = AppConfig {
            runner_path: Some(Utf8PathBuf::from("/usr/local/bin/duttest-runner")),
            ..AppConfig::default()
        };
        let command = build_runner_command(&config).expect("command");
        assert!(matches!(command, RunnerCommand::Local(path) if path.as_str() == "/usr/local/bin/duttest-runner"));
    }

    #[test]
    fn build_runner_command_requires_runner_path_for_ssh_target() {
        let config = AppConfig {
            target: Some("root@dut.local".to_owned()),
            runner_path: None,
            ..AppConfig::default()
        };
        let outcome = build_runner_command(&config);
        assert!(matches!(
            outcome,
            Err(DutTestError::Config(ConfigError::MissingRequired { .. }))
        ));
    }

    #[tokio::test]
    async fn reboot_dut_requires_a_target() {
        let config = AppConfig::default();
        let outcome = reboot_dut(&config).await;
        assert!(matches!(
            outcome,
            Err(DutTestError::Config(ConfigError::MissingRequired { .. }))
        ));
    }

    #[test]
    fn build_runner_command_is_ssh_with_a_target() {
        let config = AppConfig {
            target: Some("root@dut.local:22".to_owned()),
            runner_path: Some(Utf8PathBuf::from("/usr/local/bin/duttest-runner")),
            ..AppConfig::default()
        };
        let command = build_runner_command(&config).expect("command");
        assert!(matches!(command, RunnerCommand::Ssh { .. }));
    }
}
