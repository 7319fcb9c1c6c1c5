//! Control server - serves the control protocol for a local target
//!
//! An axum router with one POST route per operation runs on a small tokio
//! runtime owned by the server. The target is synchronous, so each request
//! runs on the blocking pool.

use crate::process::LogLine;
use crate::rpc::{dispatch, RemoteClient, Request, Response};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// How long `stop` waits for in-flight requests
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type Target = Arc<dyn RemoteClient>;

#[derive(Deserialize)]
struct PortBody {
    port: u16,
}

#[derive(Deserialize)]
struct HostBody {
    host: String,
}

/// A running control server
pub struct ControlServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    runtime: Option<Runtime>,
}

impl ControlServer {
    /// Bind `addr` and start serving requests against `target`
    ///
    /// Must not be called from inside a tokio runtime.
    pub fn bind(addr: impl Into<SocketAddr>, target: Target) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("control")
            .enable_all()
            .build()?;

        let listener = runtime.block_on(tokio::net::TcpListener::bind(addr.into()))?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let router = build_router(target);
        runtime.spawn(async move {
            let stopped = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(stopped).await {
                warn!(error = %e, "Control server failed");
            }
        });

        info!(addr = %local_addr, "Control server listening");

        Ok(Self {
            local_addr,
            shutdown: Some(shutdown_tx),
            runtime: Some(runtime),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop serving; idle connections are closed after a short grace period
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(SHUTDOWN_GRACE);
            debug!(addr = %self.local_addr, "Control server stopped");
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Routes of the control protocol
pub fn build_router(target: Target) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/start_node", post(start_node))
        .route("/start_switch", post(start_switch))
        .route("/start_client", post(start_client))
        .route("/start_logging", post(start_logging))
        .route("/poll_stats", post(poll_stats))
        .route("/receive_log", post(receive_log))
        .route("/shutdown", post(shutdown))
        .with_state(target)
}

impl IntoResponse for Response {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            Response::Error { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::OK,
        };
        (status, Json(self)).into_response()
    }
}

/// Run `request` against the target off the async workers
async fn run(target: Target, request: Request) -> Response {
    let route = request.route();
    match tokio::task::spawn_blocking(move || dispatch(target.as_ref(), request)).await {
        Ok(response) => response,
        Err(e) => {
            warn!(route = route, error = %e, "Control request panicked");
            Response::Error {
                message: format!("{} failed: {}", route, e),
            }
        }
    }
}

// ─── Handlers ────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn start_node(State(target): State<Target>, Json(body): Json<PortBody>) -> Response {
    run(target, Request::StartNode { port: body.port }).await
}

async fn start_switch(State(target): State<Target>) -> Response {
    run(target, Request::StartSwitch).await
}

async fn start_client(State(target): State<Target>) -> Response {
    run(target, Request::StartClient).await
}

async fn start_logging(State(target): State<Target>, Json(body): Json<HostBody>) -> Response {
    run(target, Request::StartLogging { host: body.host }).await
}

async fn poll_stats(State(target): State<Target>) -> Response {
    run(target, Request::PollStats).await
}

async fn receive_log(State(target): State<Target>, Json(line): Json<LogLine>) -> Response {
    run(target, Request::ReceiveLog { line }).await
}

async fn shutdown(State(target): State<Target>) -> Response {
    run(target, Request::Shutdown).await
}
