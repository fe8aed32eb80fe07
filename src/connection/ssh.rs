//! The production [`SshClient`] implementation, backed by `russh`.
//!
//! Every other module in `connection/` is generic over the [`SshClient`]
//! seam and is exercised in tests against hand-rolled fakes; this is the one
//! concrete implementation that actually opens a socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::PrivateKeyWithHashAlg;
use tokio::sync::Mutex;

use crate::error::ConnectionError;

use super::{CloseFuture, ConnectOptions, ExecFuture, OpenFuture, PingFuture, SessionId, SshClient, Target};

/// Accepts any server host key.
///
/// DUTs in this harness are ephemeral lab/CI devices reimaged between runs;
/// there is no stable host-key fingerprint worth pinning, and the spec's
/// authentication boundary (§1 Non-goals: "authentication beyond SSH key
/// pairs") is about the client's own key, not server verification.
struct AcceptAnyHostKey;

impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// A `russh`-backed [`SshClient`]: every session is a live, authenticated
/// `russh` handle keyed by an internally assigned [`SessionId`].
#[derive(Default)]
pub struct RusshClient {
    sessions: Mutex<HashMap<SessionId, Arc<Handle<AcceptAnyHostKey>>>>,
    next_id: AtomicU64,
}

impl RusshClient {
    /// Creates an empty client with no live sessions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn session(&self, id: SessionId) -> Result<Arc<Handle<AcceptAnyHostKey>>, ConnectionError> {
        self.sessions
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| ConnectionError::TargetBroken {
                target: String::new(),
                message: format!("no live session for id {id}"),
            })
    }

    async fn load_key(
        options: &ConnectOptions,
    ) -> Result<russh_keys::PrivateKey, ConnectionError> {
        let Some(key_file) = options.key_file.as_ref() else {
            return Err(ConnectionError::DialFailed {
                target: String::new(),
                attempts: 1,
                message: "no key_file configured".to_owned(),
            });
        };
        russh_keys::load_secret_key(key_file.as_std_path(), None).map_err(|e| {
            ConnectionError::DialFailed {
                target: String::new(),
                attempts: 1,
                message: format!("failed to load key '{key_file}': {e}"),
            }
        })
    }
}

impl SshClient for RusshClient {
    fn open<'a>(&'a self, target: &'a Target, options: &'a ConnectOptions) -> OpenFuture<'a> {
        Box::pin(async move {
            let config = Arc::new(client::Config {
                inactivity_timeout: Some(options.connect_timeout),
                ..client::Config::default()
            });

            let addr = (target.host.as_str(), target.port);
            let connect = client::connect(config, addr, AcceptAnyHostKey);
            let mut handle = tokio::time::timeout(options.connect_timeout, connect)
                .await
                .map_err(|_elapsed| ConnectionError::DialFailed {
                    target: target.to_string(),
                    attempts: 1,
                    message: "connect timed out".to_owned(),
                })?
                .map_err(|e| ConnectionError::DialFailed {
                    target: target.to_string(),
                    attempts: 1,
                    message: e.to_string(),
                })?;

            let key = Self::load_key(options).await.map_err(|e| match e {
                ConnectionError::DialFailed { attempts, message, .. } => {
                    ConnectionError::DialFailed {
                        target: target.to_string(),
                        attempts,
                        message,
                    }
                }
                other => other,
            })?;
            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

            let authenticated = handle
                .authenticate_publickey(target.user.clone(), key_with_hash)
                .await
                .map_err(|e| ConnectionError::DialFailed {
                    target: target.to_string(),
                    attempts: 1,
                    message: e.to_string(),
                })?;
            if !authenticated.success() {
                return Err(ConnectionError::DialFailed {
                    target: target.to_string(),
                    attempts: 1,
                    message: "public key authentication rejected".to_owned(),
                });
            }

            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.sessions.lock().await.insert(id, Arc::new(handle));
            Ok(id)
        })
    }

    fn ping<'a>(&'a self, session: SessionId) -> PingFuture<'a> {
        Box::pin(async move {
            let (code, _stdout, _stderr) = self.run_exec(session, "true").await?;
            if code == 0 {
                Ok(())
            } else {
                Err(ConnectionError::TargetBroken {
                    target: String::new(),
                    message: format!("keepalive probe exited with code {code}"),
                })
            }
        })
    }

    fn exec<'a>(&'a self, session: SessionId, command: &'a str) -> ExecFuture<'a> {
        Box::pin(async move { self.run_exec(session, command).await })
    }

    fn close<'a>(&'a self, session: SessionId) -> CloseFuture<'a> {
        Box::pin(async move {
            let Some(handle) = self.sessions.lock().await.remove(&session) else {
                return Ok(());
            };
            handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
                .map_err(|e| ConnectionError::TargetBroken {
                    target: String::new(),
                    message: e.to_string(),
                })
        })
    }
}

impl RusshClient {
    async fn run_exec(
        &self,
        session: SessionId,
        command: &str,
    ) -> Result<(i32, Vec<u8>, Vec<u8>), ConnectionError> {
        let handle = self.session(session).await?;
        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| ConnectionError::TargetBroken {
                target: String::new(),
                message: format!("channel open failed: {e}"),
            })?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ConnectionError::TargetBroken {
                target: String::new(),
                message: format!("exec failed: {e}"),
            })?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = 0_i32;

        loop {
            let Some(message) = channel.wait().await else {
                break;
            };
            match message {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = i32::try_from(exit_status).unwrap_or(i32::MAX);
                }
                ChannelMsg::Eof | ChannelMsg::Close => break,
                _ => {}
            }
        }

        Ok((exit_code, stdout, stderr))
    }
}
