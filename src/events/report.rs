//! Handler (d): forwards each finalized entity result to an external
//! aggregator over gRPC, if configured with a server address.
//!
//! Connection and per-call failures are logged and otherwise ignored:
//! result forwarding is a convenience, not a condition of the run. The one
//! exception is an explicit `terminate=true` acknowledgement, which is
//! always surfaced as a fatal run error.

use tonic::transport::Channel;

use crate::error::{DutTestError, EventsError};
use crate::result::EntityResult;

use super::{Handler, HandlerFuture};

mod proto {
    #![expect(
        missing_docs,
        clippy::pedantic,
        clippy::missing_const_for_fn,
        reason = "generated code"
    )]
    tonic::include_proto!("duttest.report");
}

use proto::report_service_client::ReportServiceClient;
pub use proto::report_service_server::{ReportService, ReportServiceServer};
pub use proto::{EntityResultMessage, ReportAck};

/// Forwards finalized results to `address`, lazily connecting on the first
/// `EntityEnd`.
pub struct ReportClient {
    address: String,
    client: Option<ReportServiceClient<Channel>>,
    connect_failed: bool,
}

impl ReportClient {
    /// Creates a client targeting `address` (e.g. `http://reports.internal:9090`).
    #[must_use]
    pub fn new(address: String) -> Self {
        Self {
            address,
            client: None,
            connect_failed: false,
        }
    }

    async fn client(&mut self) -> Option<&mut ReportServiceClient<Channel>> {
        if self.client.is_none() && !self.connect_failed {
            match ReportServiceClient::connect(self.address.clone()).await {
                Ok(client) => self.client = Some(client),
                Err(error) => {
                    tracing::warn!(address = %self.address, %error, "report server unreachable, results will not be forwarded");
                    self.connect_failed = true;
                }
            }
        }
        self.client.as_mut()
    }
}

fn to_message(result: &EntityResult) -> EntityResultMessage {
    EntityResultMessage {
        name: result.name.clone(),
        start_unix_ms: result.start.timestamp_millis(),
        end_unix_ms: result.end.map(|end| end.timestamp_millis()),
        failure_reasons: result.errors.iter().map(|e| e.reason.clone()).collect(),
        skip_reasons: result.skip_reasons.clone(),
    }
}

impl Handler for ReportClient {
    fn name(&self) -> &'static str {
        "report_client"
    }

    fn on_entity_end<'a>(&'a mut self, result: &'a EntityResult) -> HandlerFuture<'a> {
        Box::pin(async move {
            let message = to_message(result);
            let Some(client) = self.client().await else {
                return Ok(());
            };
            match client.report_result(message).await {
                Ok(response) => {
                    if response.into_inner().terminate {
                        return Err(DutTestError::Events(EventsError::ReportTerminateRequested {
                            reason: format!("report server requested termination after '{}'", result.name),
                        }));
                    }
                    Ok(())
                }
                Err(status) => {
                    tracing::warn!(entity = %result.name, %status, "failed to forward result to report server");
                    Ok(())
                }
            }
        })
    }
}
