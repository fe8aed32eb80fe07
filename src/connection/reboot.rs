//! Reboot sequencing: request a reboot, then poll until the DUT comes back
//! with a different boot identifier.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::ConnectionError;

use super::{ConnCache, SshClient, Target};

const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";
const REBOOT_COMMAND_DEADLINE: Duration = Duration::from_secs(3);
const POLL_PAUSE: Duration = Duration::from_secs(3);

/// Tuning for a reboot sequence.
#[derive(Debug, Clone)]
pub struct RebootOptions {
    /// Total time budget for the DUT to come back with a new boot identifier.
    pub timeout: Duration,
    /// Delay between reconnect polls.
    pub poll_interval: Duration,
}

impl Default for RebootOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(240),
            poll_interval: POLL_PAUSE,
        }
    }
}

/// A hook invoked immediately before the reboot command is issued, e.g. to
/// flush pending state to the DUT.
pub type PreRebootHook =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Reads the current boot identifier via `client`'s `exec`, over `session`.
async fn read_boot_id<C: SshClient>(
    client: &C,
    session: super::SessionId,
) -> Result<String, ConnectionError> {
    let (code, stdout, _stderr) = client
        .exec(session, &format!("cat {BOOT_ID_PATH}"))
        .await?;
    if code != 0 {
        return Err(ConnectionError::TargetBroken {
            target: String::new(),
            message: format!("reading {BOOT_ID_PATH} exited with code {code}"),
        });
    }
    Ok(String::from_utf8_lossy(&stdout).trim().to_owned())
}

/// Reboots the DUT at `target` and waits for it to come back with a
/// different boot identifier.
///
/// Sequence: invoke `pre_reboot` if given, read the current boot id, issue
/// `reboot` with a short deadline (its failure is ignored — the SSH channel
/// dies with the network regardless), then poll by reconnecting and
/// re-reading the boot id until it changes or `options.timeout` elapses.
///
/// # Errors
///
/// Returns [`ConnectionError::RebootTimedOut`] if the boot identifier has not
/// changed within `options.timeout`.
pub async fn reboot<C: SshClient>(
    cache: &ConnCache<C>,
    target: &Target,
    options: &RebootOptions,
    pre_reboot: Option<&PreRebootHook>,
) -> Result<(), ConnectionError> {
    if let Some(hook) = pre_reboot {
        hook().await;
    }

    let session = cache.get(target).await?;
    let client = &cache.client;
    let before = read_boot_id(client, session).await?;

    let _ignored = tokio::time::timeout(
        REBOOT_COMMAND_DEADLINE,
        client.exec(session, "reboot"),
    )
    .await;
    cache.evict(target).await;

    let deadline = tokio::time::Instant::now() + options.timeout;
    loop {
        tokio::time::sleep(options.poll_interval).await;

        if tokio::time::Instant::now() >= deadline {
            return Err(ConnectionError::RebootTimedOut {
                target: target.to_string(),
                seconds: options.timeout.as_secs(),
                reason: "boot identifier did not change".to_owned(),
            });
        }

        let Ok(session) = cache.get(target).await else {
            continue;
        };
        let Ok(after) = read_boot_id(client, session).await else {
            cache.evict(target).await;
            continue;
        };
        if after != before {
            return Ok(());
        }
        cache.evict(target).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::connection::{ConnectOptions, OpenFuture, PingFuture, ExecFuture, CloseFuture, SessionId};

    struct RebootingClient {
        boot_id_calls: Arc<AtomicU32>,
    }

    impl SshClient for RebootingClient {
        fn open<'a>(&'a self, _target: &'a Target, _options: &'a ConnectOptions) -> OpenFuture<'a> {
            Box::pin(async move { Ok(1) })
        }

        fn ping<'a>(&'a self, _session: SessionId) -> PingFuture<'a> {
            Box::pin(async move { Ok(()) })
        }

        fn exec<'a>(&'a self, _session: SessionId, command: &'a str) -> ExecFuture<'a> {
            let calls = Arc::clone(&self.boot_id_calls);
            let command = command.to_owned();
            Box::pin(async move {
                if command.contains("boot_id") {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    let id = if n == 0 { "before-id" } else { "after-id" };
                    Ok((0, id.as_bytes().to_vec(), Vec::new()))
                } else {
                    Ok((0, Vec::new(), Vec::new()))
                }
            })
        }

        fn close<'a>(&'a self, _session: SessionId) -> CloseFuture<'a> {
            Box::pin(async move { Ok(()) })
        }
    }

    #[tokio::test]
    async fn reboot_succeeds_once_boot_id_changes() {
        let client = RebootingClient {
            boot_id_calls: Arc::new(AtomicU32::new(0)),
        };
        let cache = ConnCache::new(client, ConnectOptions::default());
        let target = Target::parse("root@dut").expect("parse");
        let options = RebootOptions {
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(1),
        };

        reboot(&cache, &target, &options, None).await.expect("reboot");
    }

    struct NeverChangingClient;

    impl SshClient for NeverChangingClient {
        fn open<'a>(&'a self, _target: &'a Target, _options: &'a ConnectOptions) -> OpenFuture<'a> {
            Box::pin(async move { Ok(1) })
        }

        fn ping<'a>(&'a self, _session: SessionId) -> PingFuture<'a> {
            Box::pin(async move { Ok(()) })
        }

        fn exec<'a>(&'a self, _session: SessionId, _command: &'a str) -> ExecFuture<'a> {
            Box::pin(async move { Ok((0, b"same-id".to_vec(), Vec::new())) })
        }

        fn close<'a>(&'a self, _session: SessionId) -> CloseFuture<'a> {
            Box::pin(async move { Ok(()) })
        }
    }

    #[tokio::test]
    async fn reboot_times_out_when_boot_id_never_changes() {
        let cache = ConnCache::new(NeverChangingClient, ConnectOptions::default());
        let target = Target::parse("root@dut").expect("parse");
        let options = RebootOptions {
            timeout: Duration::from_millis(5),
            poll_interval: Duration::from_millis(1),
        };

        let result = reboot(&cache, &target, &options, None).await;
        assert!(matches!(result, Err(ConnectionError::RebootTimedOut { .. })));
    }
}
