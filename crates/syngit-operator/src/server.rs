//! Admission HTTP server
//!
//! One router carries the health probes, the static validators and the
//! dynamic interceptor route.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tracing::info;

use syngit_common::{Error, Result};

use crate::context::Context;
use crate::registry::{intercept_handler, InterceptorRegistry, INTERCEPT_ROUTE};
use crate::validators;

/// Shared state for webhook handlers
pub struct WebhookState {
    /// Dependencies of the admission path
    pub ctx: Arc<Context>,
    /// Per-RemoteSyncer interceptors
    pub registry: Arc<InterceptorRegistry>,
}

impl WebhookState {
    /// Create the state from a context and a registry
    pub fn new(ctx: Arc<Context>, registry: Arc<InterceptorRegistry>) -> Self {
        Self { ctx, registry }
    }
}

async fn ok() -> &'static str {
    "ok"
}

/// Create the router with every endpoint
///
/// - GET /healthz, /readyz
/// - POST /validate-syngit-io-v1beta3-* and /syngit-v1beta3-*
/// - POST /syngit/validate/{namespace}/{name}
pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/healthz", get(ok))
        .route("/readyz", get(ok))
        .merge(validators::routes())
        .route(INTERCEPT_ROUTE, post(intercept_handler))
        .with_state(state)
}

/// Serve the router until the process exits
///
/// With a certificate and key the server terminates TLS itself, otherwise it
/// serves plain HTTP.
pub async fn serve(
    state: Arc<WebhookState>,
    addr: SocketAddr,
    tls: Option<(PathBuf, PathBuf)>,
) -> Result<()> {
    let app = router(state);
    match tls {
        Some((cert, key)) => {
            let config = RustlsConfig::from_pem_file(&cert, &key)
                .await
                .map_err(|e| {
                    Error::internal_with_context("server", format!("TLS config error: {}", e))
                })?;
            info!(%addr, cert = %cert.display(), "starting admission server (TLS)");
            axum_server::bind_rustls(addr, config)
                .serve(app.into_make_service())
                .await
        }
        None => {
            info!(%addr, "starting admission server (plain HTTP)");
            axum_server::bind(addr).serve(app.into_make_service()).await
        }
    }
    .map_err(|e| Error::internal_with_context("server", format!("server error: {}", e)))
}
