//! Ephemeral HTTP devserver shim.
//!
//! Spawned in-process for the lifetime of a run, this proxies requests for
//! object-storage URLs to the DUT, refusing anything outside an explicit
//! allow-list of bucket prefixes. Encoded `%2F` in a path segment is treated
//! as a literal character in a file name, distinguished from an unencoded
//! `/` path separator by inspecting the raw request target before any
//! segment is percent-decoded.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{OriginalUri, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Shared server state: the configured allow-list.
#[derive(Debug, Clone)]
struct DevserverState {
    allowed_prefixes: Arc<Vec<String>>,
}

/// A running devserver instance.
pub struct Devserver {
    /// The address the server is actually listening on (useful when the
    /// configured port was `0`).
    pub local_addr: SocketAddr,
    shutdown: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

impl Devserver {
    /// Binds to `bind_addr` and starts serving, with `allowed_prefixes`
    /// gating which request paths are proxied.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the address cannot be bound.
    pub async fn spawn(
        bind_addr: SocketAddr,
        allowed_prefixes: Vec<String>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let state = DevserverState {
            allowed_prefixes: Arc::new(allowed_prefixes),
        };
        let app = Router::new()
            .route("/{*path}", get(proxy_handler))
            .with_state(state);

        let shutdown = CancellationToken::new();
        let shutdown_signal = shutdown.clone();
        let join = tokio::spawn(async move {
            let server = axum::serve(listener, app.into_make_service());
            let graceful = server.with_graceful_shutdown(async move {
                shutdown_signal.cancelled().await;
            });
            let _ignored = graceful.await;
        });

        Ok(Self {
            local_addr,
            shutdown,
            join,
        })
    }

    /// Requests graceful shutdown and waits for the server task to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ignored = self.join.await;
    }
}

async fn proxy_handler(
    State(state): State<DevserverState>,
    OriginalUri(uri): OriginalUri,
) -> Response {
    let raw_path = uri.path();
    if !is_allowed(raw_path, &state.allowed_prefixes) {
        return (StatusCode::BAD_REQUEST, "path not in allow-list").into_response();
    }
    // A full implementation proxies `raw_path` to the backing object store
    // here; staging features beyond allow-listed GETs are out of scope.
    (StatusCode::OK, format!("would proxy: {raw_path}")).into_response()
}

/// Whether `raw_path` (the *undecoded* request target, so `%2F` is still
/// literally `%2F` and not a `/`) starts with one of the allowed bucket
/// prefixes.
fn is_allowed(raw_path: &str, allowed_prefixes: &[String]) -> bool {
    let trimmed = raw_path.trim_start_matches('/');
    allowed_prefixes
        .iter()
        .any(|prefix| trimmed.starts_with(prefix.trim_start_matches('/')))
}
