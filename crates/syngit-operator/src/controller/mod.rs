//! Controller runner
//!
//! Builds the controller futures `main` drives next to the admission server.

pub mod webhook_config;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use syngit_common::crd::RemoteSyncer;

use crate::cluster::KubeClusterClient;
use crate::config::WebhookService;
use crate::registry::InterceptorRegistry;
use webhook_config::{error_policy, reconcile, WebhookConfigContext};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the webhook configuration controller future
pub fn build_webhook_config_controller(
    client: Client,
    registry: Arc<InterceptorRegistry>,
    service: WebhookService,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let ctx = Arc::new(WebhookConfigContext::new(
        Arc::new(KubeClusterClient::new(client.clone())),
        registry,
        service,
    ));
    let syncers: Api<RemoteSyncer> = Api::all(client);

    tracing::info!("- RemoteSyncer webhook configuration controller");

    Box::pin(
        Controller::new(syncers, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("WebhookConfig")),
    )
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
