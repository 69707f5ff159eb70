//! Dynamic interceptor registry
//!
//! One admission endpoint per RemoteSyncer, at
//! `/syngit/validate/{namespace}/{name}`. Handlers hold a copy of their
//! RemoteSyncer and are filled lazily: the first request after a restart
//! fetches the RemoteSyncer and caches it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kube::api::DynamicObject;
use kube::core::admission::AdmissionReview;
use kube::ResourceExt;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use syngit_common::crd::RemoteSyncer;

use crate::admission::{deny, parse_review, pipeline};
use crate::cluster::ClusterClient;
use crate::server::WebhookState;

/// Route served by the registry
pub const INTERCEPT_ROUTE: &str = "/syngit/validate/{namespace}/{name}";

/// Path of the handler for a RemoteSyncer
pub fn handler_path(namespace: &str, name: &str) -> String {
    format!("/syngit/validate/{}/{}", namespace, name)
}

/// Error type for registry lookups
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No RemoteSyncer behind the requested path
    #[error("no RemoteSyncer {namespace}/{name}")]
    NotFound {
        /// Namespace from the path
        namespace: String,
        /// Name from the path
        name: String,
    },

    /// The RemoteSyncer could not be fetched
    #[error("failed to fetch the RemoteSyncer: {0}")]
    Cluster(#[from] syngit_common::Error),
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = match &self {
            RegistryError::NotFound { .. } => StatusCode::NOT_FOUND,
            RegistryError::Cluster(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}

/// Cached RemoteSyncers keyed by handler path
#[derive(Default)]
pub struct InterceptorRegistry {
    handlers: RwLock<HashMap<String, Arc<RemoteSyncer>>>,
}

impl InterceptorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the handler of a RemoteSyncer
    pub async fn register(&self, syncer: RemoteSyncer) -> Arc<RemoteSyncer> {
        let path = handler_path(&syncer.namespace().unwrap_or_default(), &syncer.name_any());
        let syncer = Arc::new(syncer);
        self.handlers.write().await.insert(path, syncer.clone());
        syncer
    }

    /// Replace the cached copy of a RemoteSyncer, if it is cached
    pub async fn refresh(&self, syncer: &RemoteSyncer) {
        let path = handler_path(&syncer.namespace().unwrap_or_default(), &syncer.name_any());
        if let Some(cached) = self.handlers.write().await.get_mut(&path) {
            *cached = Arc::new(syncer.clone());
        }
    }

    /// Remove a handler; returns whether one was installed
    pub async fn unregister(&self, namespace: &str, name: &str) -> bool {
        self.handlers
            .write()
            .await
            .remove(&handler_path(namespace, name))
            .is_some()
    }

    /// Cached RemoteSyncer behind a handler path
    pub async fn get(&self, path: &str) -> Option<Arc<RemoteSyncer>> {
        self.handlers.read().await.get(path).cloned()
    }

    /// Cached RemoteSyncer, fetched from the cluster on a miss
    pub async fn resolve(
        &self,
        cluster: &dyn ClusterClient,
        namespace: &str,
        name: &str,
    ) -> Result<Arc<RemoteSyncer>, RegistryError> {
        if let Some(syncer) = self.get(&handler_path(namespace, name)).await {
            return Ok(syncer);
        }
        let syncer = cluster
            .get_remote_syncer(namespace, name)
            .await?
            .ok_or_else(|| RegistryError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;
        debug!(namespace, name, "registering interceptor");
        Ok(self.register(syncer).await)
    }
}

/// Query parameters the API server appends to webhook calls
#[derive(Debug, Default, Deserialize)]
pub struct InterceptParams {
    /// Deadline of the call (`10s`)
    pub timeout: Option<String>,
}

/// Parse a webhook timeout such as `10s`, `500ms` or `1m30s`
pub fn parse_timeout(raw: &str) -> Option<Duration> {
    let mut total = Duration::ZERO;
    let mut rest = raw.trim();
    if rest.is_empty() {
        return None;
    }
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];
        let step = match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60)?),
            "h" => Duration::from_secs(value.checked_mul(3600)?),
            _ => return None,
        };
        total = total.checked_add(step)?;
    }
    Some(total)
}

/// Handle an intercepted write for one RemoteSyncer
pub async fn intercept_handler(
    State(state): State<Arc<WebhookState>>,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<InterceptParams>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Result<Json<AdmissionReview<DynamicObject>>, RegistryError> {
    let syncer = state
        .registry
        .resolve(state.ctx.cluster.as_ref(), &namespace, &name)
        .await
        .inspect_err(|e| warn!(namespace = %namespace, name = %name, error = %e, "no interceptor"))?;

    let request = match parse_review(body) {
        Ok(request) => request,
        Err(response) => return Ok(Json(response.into_review())),
    };

    // Cancelled when the API server gives up on the call and drops the request.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let run = pipeline::run(&state.ctx, &syncer, &request, &cancel);
    let response = match params.timeout.as_deref().and_then(parse_timeout) {
        Some(deadline) => match tokio::time::timeout(deadline, run).await {
            Ok(response) => response,
            Err(_) => {
                cancel.cancel();
                error!(namespace = %namespace, name = %name, ?deadline, "interception deadline exceeded");
                deny(
                    &request,
                    504,
                    format!("the interception did not complete within {:?}", deadline),
                )
            }
        },
        None => run.await,
    };

    info!(
        namespace = %namespace,
        name = %name,
        uid = %request.uid,
        allowed = response.allowed,
        "intercepted"
    );
    Ok(Json(response.into_review()))
}
