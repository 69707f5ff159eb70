//! Shared state handed to every admission handler and controller

use std::sync::Arc;

use kube::Client;

use syngit_common::DEFAULT_MANAGER_NAMESPACE;

use crate::admission::pusher::{Git2Pusher, GitPusher};
use crate::admission::status::StatusLocks;
use crate::cluster::{ClusterClient, KubeClusterClient};
use crate::config::FeatureGates;

/// Dependencies of the admission path
pub struct Context {
    /// Cluster API (trait object for testability)
    pub cluster: Arc<dyn ClusterClient>,
    /// Git engine (trait object for testability)
    pub pusher: Arc<dyn GitPusher>,
    /// Namespace holding cluster default ConfigMaps and host CA bundles
    pub manager_namespace: String,
    /// Enabled feature gates
    pub feature_gates: FeatureGates,
    /// Per-RemoteSyncer status locks
    pub status_locks: StatusLocks,
}

impl Context {
    /// Create a builder around a cluster client
    pub fn builder(cluster: Arc<dyn ClusterClient>) -> ContextBuilder {
        ContextBuilder::new(cluster)
    }

    /// Context backed by a real kube Client and the libgit2 engine
    pub fn new(client: Client, manager_namespace: impl Into<String>, gates: FeatureGates) -> Self {
        Self::builder(Arc::new(KubeClusterClient::new(client)))
            .manager_namespace(manager_namespace)
            .feature_gates(gates)
            .build()
    }

    /// Context for tests: the given cluster, a given pusher, default settings
    #[cfg(test)]
    pub fn for_testing(cluster: Arc<dyn ClusterClient>, pusher: Arc<dyn GitPusher>) -> Self {
        Self::builder(cluster).pusher(pusher).build()
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    cluster: Arc<dyn ClusterClient>,
    pusher: Option<Arc<dyn GitPusher>>,
    manager_namespace: String,
    feature_gates: FeatureGates,
}

impl ContextBuilder {
    fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            cluster,
            pusher: None,
            manager_namespace: DEFAULT_MANAGER_NAMESPACE.to_string(),
            feature_gates: FeatureGates::default(),
        }
    }

    /// Override the Git engine (primarily for testing)
    pub fn pusher(mut self, pusher: Arc<dyn GitPusher>) -> Self {
        self.pusher = Some(pusher);
        self
    }

    /// Set the manager namespace
    pub fn manager_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.manager_namespace = namespace.into();
        self
    }

    /// Set the feature gates
    pub fn feature_gates(mut self, gates: FeatureGates) -> Self {
        self.feature_gates = gates;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            cluster: self.cluster,
            pusher: self.pusher.unwrap_or_else(|| Arc::new(Git2Pusher)),
            manager_namespace: self.manager_namespace,
            feature_gates: self.feature_gates,
            status_locks: StatusLocks::default(),
        }
    }
}
