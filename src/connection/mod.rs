//! SSH connection cache: open, ping, reuse, and rebuild connections to
//! devices under test, with companion port-forward services.
//!
//! Command execution is wrapped behind a small trait seam
//! ([`SshClient`]) so the cache's retry, health-check, and reboot logic can
//! be unit-tested without a live SSH server.

pub mod diagnosis;
pub mod reboot;
pub mod ssh;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use camino::Utf8PathBuf;
use tokio::sync::Mutex;

use crate::error::ConnectionError;

/// A parsed `[user@]host[:port]` target specification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    /// The SSH login user; defaults to `root` for this class of DUT.
    pub user: String,
    /// The hostname or address.
    pub host: String,
    /// The SSH port; defaults to `22`.
    pub port: u16,
}

impl Target {
    /// Parses a target specification.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidTarget`] if `spec` has an empty
    /// host segment or a non-numeric port.
    pub fn parse(spec: &str) -> Result<Self, ConnectionError> {
        let (user, rest) = match spec.split_once('@') {
            Some((user, rest)) => (user.to_owned(), rest),
            None => ("root".to_owned(), spec),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port_str)) => {
                let port = port_str.parse::<u16>().map_err(|_| ConnectionError::InvalidTarget {
                    target: spec.to_owned(),
                    reason: format!("invalid port '{port_str}'"),
                })?;
                (host, port)
            }
            None => (rest, 22),
        };
        if host.is_empty() {
            return Err(ConnectionError::InvalidTarget {
                target: spec.to_owned(),
                reason: "empty host".to_owned(),
            });
        }
        Ok(Self {
            user,
            host: host.to_owned(),
            port,
        })
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Configuration governing connection attempts.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Per-attempt connect timeout.
    pub connect_timeout: Duration,
    /// Number of retries after the first attempt.
    pub retries: u32,
    /// Delay between retries.
    pub retry_interval: Duration,
    /// Path to the private key file used for authentication.
    pub key_file: Option<Utf8PathBuf>,
    /// Directory to search for additional keys.
    pub key_dir: Option<Utf8PathBuf>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            retries: 2,
            retry_interval: Duration::from_secs(2),
            key_file: None,
            key_dir: None,
        }
    }
}

/// An opaque handle for a live session, as far as the cache is concerned.
/// The concrete type implementing [`SshClient`] owns the real `russh`
/// session behind this identifier.
pub type SessionId = u64;

/// Boxed future returned by [`SshClient::open`].
pub type OpenFuture<'a> =
    Pin<Box<dyn Future<Output = Result<SessionId, ConnectionError>> + Send + 'a>>;
/// Boxed future returned by [`SshClient::ping`].
pub type PingFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ConnectionError>> + Send + 'a>>;
/// Boxed future returned by [`SshClient::exec`].
pub type ExecFuture<'a> =
    Pin<Box<dyn Future<Output = Result<(i32, Vec<u8>, Vec<u8>), ConnectionError>> + Send + 'a>>;
/// Boxed future returned by [`SshClient::close`].
pub type CloseFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ConnectionError>> + Send + 'a>>;

/// Behaviour required to open, probe, and use an SSH session.
///
/// This abstraction keeps the cache's retry and health-check logic testable
/// without a live SSH server.
pub trait SshClient: Send + Sync {
    /// Opens a new session to `target` with `options`.
    fn open<'a>(&'a self, target: &'a Target, options: &'a ConnectOptions) -> OpenFuture<'a>;

    /// Sends a keepalive ping on `session` with a fixed five-second
    /// deadline.
    fn ping<'a>(&'a self, session: SessionId) -> PingFuture<'a>;

    /// Executes `command` on `session`, returning `(exit_code, stdout,
    /// stderr)`.
    fn exec<'a>(&'a self, session: SessionId, command: &'a str) -> ExecFuture<'a>;

    /// Tears down `session`.
    fn close<'a>(&'a self, session: SessionId) -> CloseFuture<'a>;
}

/// Companion services kept alongside a cached connection: port forwards for
/// the ephemeral devserver and, optionally, the report-RPC channel.
#[derive(Debug, Clone, Default)]
pub struct Services {
    /// Local port forwarded to the devserver on the DUT, if requested.
    pub devserver_forward_port: Option<u16>,
    /// Local port forwarded for the report RPC, if requested.
    pub report_forward_port: Option<u16>,
}

#[derive(Debug)]
struct CacheEntry {
    session: SessionId,
    services: Services,
}

/// Caches live SSH connections keyed by target, evicting and reconnecting
/// on health failures.
pub struct ConnCache<C: SshClient> {
    client: C,
    options: ConnectOptions,
    entries: Mutex<HashMap<Target, CacheEntry>>,
}

impl<C: SshClient> ConnCache<C> {
    /// Creates a cache backed by `client`.
    pub fn new(client: C, options: ConnectOptions) -> Self {
        Self {
            client,
            options,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a cached session for `target`, opening and retrying up to
    /// `options.retries` times if none exists.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::DialFailed`] if every attempt fails.
    pub async fn get(&self, target: &Target) -> Result<SessionId, ConnectionError> {
        {
            let entries = self.entries.lock().await;
            if let Some(entry) = entries.get(target) {
                return Ok(entry.session);
            }
        }
        self.open_and_cache(target).await
    }

    async fn open_and_cache(&self, target: &Target) -> Result<SessionId, ConnectionError> {
        let mut last_error = None;
        for attempt in 0..=self.options.retries {
            match self.client.open(target, &self.options).await {
                Ok(session) => {
                    let mut entries = self.entries.lock().await;
                    entries.insert(
                        target.clone(),
                        CacheEntry {
                            session,
                            services: Services::default(),
                        },
                    );
                    return Ok(session);
                }
                Err(err) => {
                    last_error = Some(err);
                    if attempt < self.options.retries {
                        tokio::time::sleep(self.options.retry_interval).await;
                    }
                }
            }
        }
        Err(ConnectionError::DialFailed {
            target: target.to_string(),
            attempts: self.options.retries + 1,
            message: last_error.map_or_else(|| "unknown error".to_owned(), |e| e.to_string()),
        })
    }

    /// Probes the cached connection for `target`; evicts it on failure so
    /// the next [`Self::get`] reconnects.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::TargetBroken`] (after eviction) if no
    /// cached entry exists or the probe fails.
    pub async fn healthy(&self, target: &Target) -> Result<(), ConnectionError> {
        let session = {
            let entries = self.entries.lock().await;
            entries.get(target).map(|e| e.session)
        };
        let Some(session) = session else {
            return Err(ConnectionError::TargetBroken {
                target: target.to_string(),
                message: "no cached connection".to_owned(),
            });
        };
        match tokio::time::timeout(Duration::from_secs(5), self.client.ping(session)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.evict(target).await;
                Err(err)
            }
            Err(_elapsed) => {
                self.evict(target).await;
                Err(ConnectionError::HealthCheckTimeout {
                    target: target.to_string(),
                    seconds: 5,
                })
            }
        }
    }

    /// Evicts the cached entry for `target`, if any, without closing it
    /// (used after the underlying transport is already known dead, e.g.
    /// across a reboot).
    pub async fn evict(&self, target: &Target) {
        self.entries.lock().await.remove(target);
    }

    /// Closes and evicts the cached connection for `target`, attempting to
    /// tear down its services first but always attempting both.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered, having still attempted the
    /// remaining teardown step.
    pub async fn close(&self, target: &Target) -> Result<(), ConnectionError> {
        let entry = self.entries.lock().await.remove(target);
        let Some(entry) = entry else {
            return Ok(());
        };
        // Services teardown is a no-op placeholder here; a full
        // implementation would close any forwarded listeners first.
        self.client.close(entry.session).await
    }

    /// Returns the services record for a cached target, if present.
    pub async fn services(&self, target: &Target) -> Option<Services> {
        self.entries.lock().await.get(target).map(|e| e.services.clone())
    }
}
