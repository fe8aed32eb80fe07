//! The bundle RPC tier: drives a bundle subprocess's `RunTests` and
//! `RunFixture` gRPC streams over a duplex constructed from its stdio pipes.
//!
//! Inbound `RunTests` events are translated into [`ControlMessage`]s so the
//! event processor (§4.4) never needs to know this hop is gRPC rather than
//! the newline-JSON framing used conceptually elsewhere in the control-message
//! schema.

pub mod duplex;

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use crate::error::BundleError;
use crate::protocol::{ControlMessage, StackOperationKind};

mod proto {
    #![expect(missing_docs, clippy::pedantic, reason = "generated code")]
    tonic::include_proto!("duttest.bundle");
}

pub use proto::bundle_service_client::BundleServiceClient;
pub use proto::bundle_service_server::{BundleService, BundleServiceServer};

/// A `mpsc::Receiver` made into a `Stream` so it can be handed to tonic as a
/// client-streaming request body.
struct ChannelStream<T>(mpsc::Receiver<T>);

impl<T> futures_util::Stream for ChannelStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().0.poll_recv(cx)
    }
}

/// Connects a gRPC channel through an already-open duplex stream (the
/// bundle's stdio pipes in production, an in-process pair in tests).
///
/// The connector can only be called once: a subprocess's pipes cannot be
/// redialled, so a second connection attempt fails outright rather than
/// silently hanging.
async fn connect_channel<IO>(io: IO) -> Result<Channel, BundleError>
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let io = Arc::new(AsyncMutex::new(Some(io)));
    Endpoint::from_static("http://[::]:0")
        .connect_with_connector(service_fn(move |_: Uri| {
            let io = Arc::clone(&io);
            async move {
                io.lock()
                    .await
                    .take()
                    .ok_or_else(|| std::io::Error::other("bundle duplex already consumed"))
            }
        }))
        .await
        .map_err(|e| BundleError::ConnectFailed {
            message: e.to_string(),
        })
}

/// Parameters for a `RunTests` invocation: the handshake plus the run's
/// `RunTestsInit` document.
#[derive(Debug, Clone, Default)]
pub struct RunTestsInit {
    /// Bundle-specific configuration, opaque to this client.
    pub bundle_config_json: String,
    /// The variable bag handed to the bundle at handshake time.
    pub variables: BTreeMap<String, String>,
    /// An optional debug port the bundle should listen on.
    pub debug_port: Option<u32>,
    /// Entities selected to run.
    pub entity_names: Vec<String>,
    /// Feature names the dependency evaluator has already resolved as
    /// available.
    pub features: Vec<String>,
    /// Test-scoped variables.
    pub test_vars: BTreeMap<String, String>,
    /// This shard's index.
    pub shard_index: u32,
    /// Total number of shards.
    pub shard_count: u32,
    /// Whether package selection should recurse into subpackages.
    pub recursive: bool,
}

/// A live `RunTests` stream: the half the caller writes
/// `StackOperationResponse`s onto.
pub struct RunTestsSession {
    requests: mpsc::Sender<proto::RunTestsRequest>,
}

impl RunTestsSession {
    /// Replies to a `StackOperation` request with `request_id`. Must be
    /// called before any further events for that operation are emitted, per
    /// the bundle protocol.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::ProtocolViolation`] if the stream has already
    /// been closed.
    pub async fn respond_stack_operation(
        &self,
        request_id: String,
        error: Option<String>,
    ) -> Result<(), BundleError> {
        let request = proto::RunTestsRequest {
            payload: Some(proto::run_tests_request::Payload::StackOperationResponse(
                proto::StackOperationResponse { request_id, error },
            )),
        };
        self.requests
            .send(request)
            .await
            .map_err(|_| BundleError::ProtocolViolation {
                message: "RunTests stream closed".to_owned(),
            })
    }
}

/// The outcome of a `RunFixture` `Push`: the ticket to `Pop` later plus any
/// log/error messages emitted during setup.
#[derive(Debug, Clone, Default)]
pub struct PushOutcome {
    /// The ticket identifying this pushed fixture for a later `Pop`.
    pub ticket: String,
    /// Log lines emitted during setup, in arrival order.
    pub logs: Vec<String>,
    /// Error reasons emitted during setup. A non-empty list does not imply
    /// the push failed outright; the caller decides whether to pop or
    /// abandon.
    pub errors: Vec<String>,
}

/// A live `RunFixture` stream, driving one push/pop lifecycle at a time.
pub struct FixtureSession {
    requests: mpsc::Sender<proto::FixtureRequest>,
    events: tonic::Streaming<proto::FixtureEvent>,
}

impl FixtureSession {
    /// Pushes `fixture_name` with `config_json`, collecting log/error
    /// messages until the bundle signals `RequestDone` with a ticket.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::ProtocolViolation`] if the stream closes
    /// before a ticket is received, or [`BundleError::Transport`] on a
    /// transport-level failure.
    pub async fn push(
        &mut self,
        fixture_name: String,
        config_json: String,
    ) -> Result<PushOutcome, BundleError> {
        let request = proto::FixtureRequest {
            payload: Some(proto::fixture_request::Payload::Push(proto::PushFixture {
                fixture_name,
                config_json,
            })),
        };
        self.requests
            .send(request)
            .await
            .map_err(|_| BundleError::ProtocolViolation {
                message: "RunFixture stream closed".to_owned(),
            })?;

        let mut outcome = PushOutcome::default();
        loop {
            let event = self
                .events
                .message()
                .await
                .map_err(BundleError::Transport)?
                .ok_or_else(|| BundleError::ProtocolViolation {
                    message: "RunFixture stream ended before RequestDone".to_owned(),
                })?;
            match event.payload {
                Some(proto::fixture_event::Payload::Log(text)) => outcome.logs.push(text),
                Some(proto::fixture_event::Payload::Error(reason)) => outcome.errors.push(reason),
                Some(proto::fixture_event::Payload::RequestDoneTicket(ticket)) => {
                    outcome.ticket = ticket;
                    return Ok(outcome);
                }
                None => {
                    return Err(BundleError::ProtocolViolation {
                        message: "FixtureEvent missing payload".to_owned(),
                    });
                }
            }
        }
    }

    /// Pops the fixture identified by `ticket`. Must be called exactly once
    /// per successful `push`, or the fixture is considered leaked.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::ProtocolViolation`] if the stream has already
    /// been closed.
    pub async fn pop(&self, ticket: String) -> Result<(), BundleError> {
        let request = proto::FixtureRequest {
            payload: Some(proto::fixture_request::Payload::Pop(ticket)),
        };
        self.requests
            .send(request)
            .await
            .map_err(|_| BundleError::ProtocolViolation {
                message: "RunFixture stream closed".to_owned(),
            })
    }
}

/// A connected bundle, ready to drive `RunTests` and `RunFixture` streams.
pub struct BundleClient {
    inner: BundleServiceClient<Channel>,
}

impl BundleClient {
    /// Connects through `io`, the bundle's stdio duplex.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::ConnectFailed`] if the channel cannot be
    /// established.
    pub async fn connect<IO>(io: IO) -> Result<Self, BundleError>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let channel = connect_channel(io).await?;
        Ok(Self {
            inner: BundleServiceClient::new(channel),
        })
    }

    /// Starts a `RunTests` stream: sends the handshake and init documents,
    /// and returns a session for replying to `StackOperation` requests plus
    /// a channel of translated [`ControlMessage`]s.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Transport`] if the stream could not be
    /// opened, or [`BundleError::HandshakeFailed`] if the handshake could
    /// not be queued.
    pub async fn run_tests(
        &mut self,
        init: RunTestsInit,
    ) -> Result<(RunTestsSession, mpsc::Receiver<Result<ControlMessage, BundleError>>), BundleError>
    {
        let (tx, rx) = mpsc::channel(8);

        let handshake = proto::RunTestsRequest {
            payload: Some(proto::run_tests_request::Payload::Handshake(
                proto::HandshakeRequest {
                    bundle_config_json: init.bundle_config_json,
                    variables: to_hash_map(init.variables),
                    debug_port: init.debug_port,
                },
            )),
        };
        let init_request = proto::RunTestsRequest {
            payload: Some(proto::run_tests_request::Payload::Init(
                proto::RunTestsInit {
                    entity_names: init.entity_names,
                    features: init.features,
                    test_vars: to_hash_map(init.test_vars),
                    shard_index: init.shard_index,
                    shard_count: init.shard_count,
                    recursive: init.recursive,
                },
            )),
        };
        tx.send(handshake)
            .await
            .map_err(|_| BundleError::HandshakeFailed {
                message: "RunTests request channel closed before handshake".to_owned(),
            })?;
        tx.send(init_request)
            .await
            .map_err(|_| BundleError::HandshakeFailed {
                message: "RunTests request channel closed before init".to_owned(),
            })?;

        let response = self
            .inner
            .run_tests(ChannelStream(rx))
            .await
            .map_err(BundleError::Transport)?;
        let mut inbound = response.into_inner();

        let (events_tx, events_rx) = mpsc::channel(32);
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(event)) => {
                        let translated = translate_run_tests_event(event);
                        if events_tx.send(translated).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(status) => {
                        let _ = events_tx.send(Err(BundleError::Transport(status))).await;
                        break;
                    }
                }
            }
        });

        Ok((RunTestsSession { requests: tx }, events_rx))
    }

    /// Opens a `RunFixture` stream.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Transport`] if the stream could not be opened.
    pub async fn run_fixture(&mut self) -> Result<FixtureSession, BundleError> {
        let (tx, rx) = mpsc::channel(8);
        let response = self
            .inner
            .run_fixture(ChannelStream(rx))
            .await
            .map_err(BundleError::Transport)?;
        Ok(FixtureSession {
            requests: tx,
            events: response.into_inner(),
        })
    }
}

fn to_hash_map(map: BTreeMap<String, String>) -> HashMap<String, String> {
    map.into_iter().collect()
}

fn translate_run_tests_event(
    event: proto::RunTestsEvent,
) -> Result<ControlMessage, BundleError> {
    use proto::run_tests_event::Payload;

    let time_ms = event.time_ms;
    let payload = event.payload.ok_or_else(|| BundleError::ProtocolViolation {
        message: "RunTestsEvent missing payload".to_owned(),
    })?;

    Ok(match payload {
        Payload::EntityStart(entity_name) => ControlMessage::EntityStart {
            time_ms,
            entity_name,
        },
        Payload::EntityLog(proto::EntityLog { entity_name, text }) => ControlMessage::EntityLog {
            time_ms,
            entity_name,
            text,
        },
        Payload::EntityError(proto::EntityError {
            entity_name,
            reason,
            file,
            line,
        }) => ControlMessage::EntityError {
            time_ms,
            entity_name,
            reason,
            file,
            line,
        },
        Payload::EntityEnd(proto::EntityEnd {
            entity_name,
            skip_reasons,
            timing_log_json,
        }) => {
            let timing_log = timing_log_json
                .map(|json| {
                    serde_json::from_str(&json).map_err(|e| BundleError::ProtocolViolation {
                        message: format!("invalid timingLogJson: {e}"),
                    })
                })
                .transpose()?;
            ControlMessage::EntityEnd {
                time_ms,
                entity_name,
                skip_reasons,
                timing_log,
            }
        }
        Payload::EntityCopyEnd(entity_name) => ControlMessage::EntityCopyEnd {
            time_ms,
            entity_name,
        },
        Payload::RunLog(text) => ControlMessage::RunLog { time_ms, text },
        Payload::StackOperation(op) => ControlMessage::StackOperation {
            time_ms,
            request_id: op.request_id.clone(),
            fixture_name: op.fixture_name.clone(),
            operation: translate_stack_operation_kind(op.operation())?,
        },
        Payload::Heartbeat(_) => ControlMessage::Heartbeat { time_ms },
    })
}

fn translate_stack_operation_kind(
    kind: proto::StackOperationKind,
) -> Result<StackOperationKind, BundleError> {
    match kind {
        proto::StackOperationKind::Push => Ok(StackOperationKind::Push),
        proto::StackOperationKind::Pop => Ok(StackOperationKind::Pop),
        proto::StackOperationKind::SetDirty => Ok(StackOperationKind::SetDirty),
        proto::StackOperationKind::Status => Ok(StackOperationKind::Status),
        proto::StackOperationKind::StackOperationKindUnspecified => {
            Err(BundleError::ProtocolViolation {
                message: "stack operation kind unspecified".to_owned(),
            })
        }
    }
}
