//! RemoteSyncer status bookkeeping
//!
//! Writes for one RemoteSyncer are serialized through a process-local mutex,
//! then retried on resourceVersion conflicts against the API server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use syngit_common::crd::{
    set_condition, Condition, ConditionStatus, LastBypassedObjectState, LastObservedObjectState,
    LastPushedObjectState, RemoteSyncerStatus,
};
use syngit_common::retry::{retry_when, RetryConfig};
use syngit_common::{Error, Result};

use crate::cluster::ClusterClient;

/// Condition type reporting the outcome of the last interception
pub const CONDITION_SYNCED: &str = "Synced";

/// Reason of a successful push
pub const REASON_PUSHED: &str = "Pushed";

/// Reason of a failed interception
pub const REASON_WEBHOOK_HANDLER_ERROR: &str = "WebhookHandlerError";

/// One mutex per RemoteSyncer
#[derive(Default)]
pub struct StatusLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl StatusLocks {
    fn lock_for(&self, namespace: &str, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let key = format!("{}/{}", namespace, name);
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(key).or_default().clone()
    }
}

/// A change to apply to the latest stored status
#[derive(Clone, Debug)]
pub enum StatusChange {
    /// A request reached the interceptor
    Observed(LastObservedObjectState),
    /// A request was let through without interception
    Bypassed(LastBypassedObjectState),
    /// Every target received the push
    Pushed(LastPushedObjectState),
    /// The interception failed
    Failed(String),
}

impl StatusChange {
    fn apply(&self, status: &mut RemoteSyncerStatus) {
        match self {
            StatusChange::Observed(state) => {
                status.last_observed_object_state = Some(state.clone());
            }
            StatusChange::Bypassed(state) => {
                status.last_bypassed_object_state = Some(state.clone());
            }
            StatusChange::Pushed(state) => {
                status.last_pushed_object_state = Some(state.clone());
                let message = format!(
                    "pushed {} {} to {} target(s)",
                    state.last_pushed_object.resource,
                    state.last_pushed_object.name,
                    state.last_pushed_targets.len()
                );
                set_condition(
                    &mut status.conditions,
                    Condition::new(
                        CONDITION_SYNCED,
                        ConditionStatus::True,
                        REASON_PUSHED,
                        message,
                    ),
                );
            }
            StatusChange::Failed(message) => set_condition(
                &mut status.conditions,
                Condition::new(
                    CONDITION_SYNCED,
                    ConditionStatus::False,
                    REASON_WEBHOOK_HANDLER_ERROR,
                    message.clone(),
                ),
            ),
        }
    }
}

/// Apply `change` to the stored status of a RemoteSyncer
///
/// A RemoteSyncer that no longer exists is not an error.
pub async fn update_status(
    cluster: &dyn ClusterClient,
    locks: &StatusLocks,
    namespace: &str,
    name: &str,
    change: &StatusChange,
) -> Result<()> {
    let lock = locks.lock_for(namespace, name);
    let _guard = lock.lock().await;

    retry_when(
        &RetryConfig::on_conflict(),
        "remotesyncer status update",
        Error::is_conflict,
        || async move {
            let Some(mut syncer) = cluster.get_remote_syncer(namespace, name).await? else {
                debug!(namespace, name, "RemoteSyncer gone, skipping status update");
                return Ok(());
            };
            let mut status = syncer.status.take().unwrap_or_default();
            change.apply(&mut status);
            syncer.status = Some(status);
            cluster.replace_remote_syncer_status(&syncer).await.map(|_| ())
        },
    )
    .await
}

/// [`update_status`], logging and dropping a failure
pub async fn record(
    cluster: &dyn ClusterClient,
    locks: &StatusLocks,
    namespace: &str,
    name: &str,
    change: StatusChange,
) {
    if let Err(e) = update_status(cluster, locks, namespace, name, &change).await {
        warn!(namespace, name, error = %e, "failed to update RemoteSyncer status");
    }
}
