//! Liveness endpoint.
//!
//! Orchestration polls `GET /healthz`: 200 while the process is live, 500
//! once it has flipped itself unhealthy ahead of a deliberate shutdown, so
//! traffic can be rerouted before termination completes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shared liveness flag, constructed once at startup and handed to every
/// component that needs to flip or read it.
#[derive(Clone)]
pub struct Liveness {
    live: Arc<AtomicBool>,
}

impl Liveness {
    /// Starts live.
    pub fn new() -> Self {
        Self {
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP server exposing the liveness flag.
pub struct HealthServer {
    addr: String,
    liveness: Liveness,
}

impl HealthServer {
    pub fn new(addr: String, liveness: Liveness) -> Self {
        Self { addr, liveness }
    }

    /// Binds and serves in a background task until cancellation. Bind
    /// failure is a startup error. Returns the bound address.
    pub async fn start(&self, cancel: CancellationToken) -> Result<SocketAddr> {
        let app = Router::new()
            .route("/healthz", get(healthz_handler))
            .with_state(self.liveness.clone());

        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("binding health endpoint on {}", self.addr))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        tokio::spawn(async move {
            info!(addr = %local_addr, "health endpoint started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                error!(error = %e, "health endpoint error");
            }
        });

        Ok(local_addr)
    }
}

/// GET /healthz.
async fn healthz_handler(State(liveness): State<Liveness>) -> impl IntoResponse {
    if liveness.is_live() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "shutting down")
    }
}
