//! RemoteSyncer webhook configuration controller
//!
//! Keeps one cluster-scoped ValidatingWebhookConfiguration in sync with the
//! RemoteSyncers of every namespace: each RemoteSyncer owns one webhook entry
//! that sends its scoped resources to its interceptor path.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::admissionregistration::v1::{
    ServiceReference, ValidatingWebhook, ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::ByteString;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument};

use syngit_common::crd::RemoteSyncer;
use syngit_common::retry::{retry_when, RetryConfig};
use syngit_common::{Error, Result, LABEL_MANAGED_BY, MANAGED_BY_SYNGIT};

use crate::cluster::ClusterClient;
use crate::config::WebhookService;
use crate::registry::{handler_path, InterceptorRegistry};

/// Name of the managed ValidatingWebhookConfiguration
pub const WEBHOOK_CONFIGURATION_NAME: &str = "syngit-remotesyncers-webhook";

/// Finalizer guarding the removal of a RemoteSyncer's webhook entry
pub const WEBHOOK_FINALIZER: &str = "syngit.io/remotesyncer-webhook";

const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";
const WEBHOOK_TIMEOUT_SECONDS: i32 = 10;

/// Dependencies of the webhook configuration controller
pub struct WebhookConfigContext {
    /// Cluster API
    pub cluster: Arc<dyn ClusterClient>,
    /// Interceptor cache shared with the admission server
    pub registry: Arc<InterceptorRegistry>,
    /// Service the entries point at
    pub service: WebhookService,
}

impl WebhookConfigContext {
    /// Create the context
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        registry: Arc<InterceptorRegistry>,
        service: WebhookService,
    ) -> Self {
        Self {
            cluster,
            registry,
            service,
        }
    }
}

/// Name of the webhook entry of a RemoteSyncer
pub fn entry_name(namespace: &str, name: &str) -> String {
    format!("{}.{}.remotesyncer.syngit.io", name, namespace)
}

/// Webhook entry routing a RemoteSyncer's scoped resources to its interceptor
pub fn build_webhook_entry(syncer: &RemoteSyncer, service: &WebhookService) -> ValidatingWebhook {
    let namespace = syncer.namespace().unwrap_or_default();
    let name = syncer.name_any();
    ValidatingWebhook {
        name: entry_name(&namespace, &name),
        admission_review_versions: vec!["v1".to_string()],
        client_config: WebhookClientConfig {
            ca_bundle: service.ca_bundle.clone().map(ByteString),
            service: Some(ServiceReference {
                name: service.name.clone(),
                namespace: service.namespace.clone(),
                path: Some(handler_path(&namespace, &name)),
                port: Some(service.port),
            }),
            url: None,
        },
        rules: Some(syncer.spec.scoped_resources.rules.clone()),
        namespace_selector: Some(LabelSelector {
            match_labels: Some([(NAMESPACE_NAME_LABEL.to_string(), namespace)].into()),
            ..Default::default()
        }),
        side_effects: "NoneOnDryRun".to_string(),
        failure_policy: Some("Fail".to_string()),
        timeout_seconds: Some(WEBHOOK_TIMEOUT_SECONDS),
        ..Default::default()
    }
}

/// Insert or replace an entry, keeping entries sorted by name
///
/// Returns whether the configuration changed.
pub fn upsert_webhook_entry(
    config: &mut ValidatingWebhookConfiguration,
    entry: ValidatingWebhook,
) -> bool {
    let webhooks = config.webhooks.get_or_insert_with(Vec::new);
    match webhooks.iter_mut().find(|w| w.name == entry.name) {
        Some(existing) if *existing == entry => false,
        Some(existing) => {
            *existing = entry;
            true
        }
        None => {
            webhooks.push(entry);
            webhooks.sort_by(|a, b| a.name.cmp(&b.name));
            true
        }
    }
}

/// Drop an entry by name; returns whether one was present
pub fn remove_webhook_entry(config: &mut ValidatingWebhookConfiguration, name: &str) -> bool {
    let Some(webhooks) = config.webhooks.as_mut() else {
        return false;
    };
    let before = webhooks.len();
    webhooks.retain(|w| w.name != name);
    webhooks.len() != before
}

fn empty_configuration() -> ValidatingWebhookConfiguration {
    ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(WEBHOOK_CONFIGURATION_NAME.to_string()),
            labels: Some([(LABEL_MANAGED_BY.to_string(), MANAGED_BY_SYNGIT.to_string())].into()),
            ..Default::default()
        },
        webhooks: Some(vec![]),
    }
}

/// Read-modify-write of the managed configuration, retried on conflicts
async fn edit_configuration<F>(cluster: &dyn ClusterClient, operation: &str, edit: F) -> Result<()>
where
    F: Fn(&mut ValidatingWebhookConfiguration) -> bool,
{
    let edit = &edit;
    retry_when(
        &RetryConfig::on_conflict(),
        operation,
        Error::is_conflict,
        || async move {
            match cluster
                .get_webhook_configuration(WEBHOOK_CONFIGURATION_NAME)
                .await?
            {
                Some(mut config) => {
                    if edit(&mut config) {
                        cluster.replace_webhook_configuration(&config).await?;
                    }
                }
                None => {
                    let mut config = empty_configuration();
                    if edit(&mut config) {
                        cluster.create_webhook_configuration(&config).await?;
                    }
                }
            }
            Ok(())
        },
    )
    .await
}

/// Reconcile a RemoteSyncer's webhook entry
#[instrument(
    skip(syncer, ctx),
    fields(syncer = %syncer.name_any(), namespace = %syncer.namespace().unwrap_or_default())
)]
pub async fn reconcile(syncer: Arc<RemoteSyncer>, ctx: Arc<WebhookConfigContext>) -> Result<Action> {
    let namespace = syncer.namespace().unwrap_or_default();
    let name = syncer.name_any();
    let entry = entry_name(&namespace, &name);
    let cluster = ctx.cluster.as_ref();

    if syncer.metadata.deletion_timestamp.is_some() {
        if !has_finalizer(&syncer) {
            return Ok(Action::await_change());
        }
        info!(entry = %entry, "removing webhook entry");
        edit_configuration(cluster, "remove webhook entry", |config| {
            remove_webhook_entry(config, &entry)
        })
        .await?;
        ctx.registry.unregister(&namespace, &name).await;
        cluster
            .remove_remote_syncer_finalizer(&namespace, &name, WEBHOOK_FINALIZER)
            .await?;
        return Ok(Action::await_change());
    }

    if !has_finalizer(&syncer) {
        debug!("adding finalizer");
        cluster
            .add_remote_syncer_finalizer(&namespace, &name, WEBHOOK_FINALIZER)
            .await?;
    }

    let webhook = build_webhook_entry(&syncer, &ctx.service);
    edit_configuration(cluster, "upsert webhook entry", |config| {
        upsert_webhook_entry(config, webhook.clone())
    })
    .await?;
    ctx.registry.refresh(&syncer).await;
    debug!(entry = %entry, "webhook entry in sync");
    Ok(Action::await_change())
}

/// Requeue failed reconciliations after a short delay
pub fn error_policy(
    syncer: Arc<RemoteSyncer>,
    error: &Error,
    _ctx: Arc<WebhookConfigContext>,
) -> Action {
    error!(
        ?error,
        syncer = %syncer.name_any(),
        namespace = %syncer.namespace().unwrap_or_default(),
        "webhook configuration reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

fn has_finalizer(syncer: &RemoteSyncer) -> bool {
    syncer.finalizers().iter().any(|f| f == WEBHOOK_FINALIZER)
}
