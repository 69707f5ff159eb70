//! Cluster API access
//!
//! Every read and write the controller issues goes through [`ClusterClient`],
//! so the admission path, the patterns and the controllers can be exercised
//! against a mock or an in-memory cluster in tests.

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

use syngit_common::crd::{RemoteSyncer, RemoteTarget, RemoteUser, RemoteUserBinding};
use syngit_common::{Error, Result, FIELD_MANAGER};

/// A single "can this user do that" question
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessReview {
    /// User being checked
    pub user: String,
    /// UID of the user
    pub uid: Option<String>,
    /// Groups of the user
    pub groups: Vec<String>,
    /// Namespace of the resource, `None` for cluster-wide
    pub namespace: Option<String>,
    /// Verb (`get`, `create`, ...)
    pub verb: String,
    /// API group
    pub group: String,
    /// API version
    pub version: String,
    /// Plural resource
    pub resource: String,
    /// Object name, `None` for any
    pub name: Option<String>,
}

/// Answer to an [`AccessReview`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessDecision {
    /// Whether the action is allowed
    pub allowed: bool,
    /// Reason given by the authorizer
    pub reason: String,
    /// Error raised while evaluating the review, if any
    pub evaluation_error: String,
}

/// Trait abstracting the Kubernetes operations used by syngit
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Get a RemoteSyncer
    async fn get_remote_syncer(&self, namespace: &str, name: &str)
        -> Result<Option<RemoteSyncer>>;

    /// List the RemoteSyncers of a namespace
    async fn list_remote_syncers(&self, namespace: &str) -> Result<Vec<RemoteSyncer>>;

    /// Write the status of a RemoteSyncer
    ///
    /// The write is conditional on the object's resourceVersion and fails with
    /// a 409 when the stored object moved on.
    async fn replace_remote_syncer_status(&self, syncer: &RemoteSyncer) -> Result<RemoteSyncer>;

    /// Add a finalizer to a RemoteSyncer if missing
    async fn add_remote_syncer_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()>;

    /// Remove a finalizer from a RemoteSyncer
    async fn remove_remote_syncer_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()>;

    /// Get a RemoteUser
    async fn get_remote_user(&self, namespace: &str, name: &str) -> Result<Option<RemoteUser>>;

    /// List RemoteUserBindings matching a label selector (empty selects all)
    async fn list_remote_user_bindings(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<RemoteUserBinding>>;

    /// Create a RemoteUserBinding
    async fn create_remote_user_binding(
        &self,
        binding: &RemoteUserBinding,
    ) -> Result<RemoteUserBinding>;

    /// Replace a RemoteUserBinding
    async fn replace_remote_user_binding(
        &self,
        binding: &RemoteUserBinding,
    ) -> Result<RemoteUserBinding>;

    /// Delete a RemoteUserBinding, ignoring a missing object
    async fn delete_remote_user_binding(&self, namespace: &str, name: &str) -> Result<()>;

    /// Get a RemoteTarget
    async fn get_remote_target(&self, namespace: &str, name: &str)
        -> Result<Option<RemoteTarget>>;

    /// List RemoteTargets matching a label selector (empty selects all)
    async fn list_remote_targets(&self, namespace: &str, selector: &str)
        -> Result<Vec<RemoteTarget>>;

    /// Create a RemoteTarget
    async fn create_remote_target(&self, target: &RemoteTarget) -> Result<RemoteTarget>;

    /// Delete a RemoteTarget, ignoring a missing object
    async fn delete_remote_target(&self, namespace: &str, name: &str) -> Result<()>;

    /// Get a Secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Get a ConfigMap
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// List ConfigMaps matching a label selector
    async fn list_config_maps(&self, namespace: &str, selector: &str) -> Result<Vec<ConfigMap>>;

    /// Ask the authorizer whether a user may perform an action
    async fn review_access(&self, review: &AccessReview) -> Result<AccessDecision>;

    /// Get a ValidatingWebhookConfiguration
    async fn get_webhook_configuration(
        &self,
        name: &str,
    ) -> Result<Option<ValidatingWebhookConfiguration>>;

    /// Create a ValidatingWebhookConfiguration
    async fn create_webhook_configuration(
        &self,
        config: &ValidatingWebhookConfiguration,
    ) -> Result<()>;

    /// Replace a ValidatingWebhookConfiguration (resourceVersion-conditional)
    async fn replace_webhook_configuration(
        &self,
        config: &ValidatingWebhookConfiguration,
    ) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Wrap a kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn list_params(selector: &str) -> ListParams {
    if selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(selector)
    }
}

fn namespace_of<K: ResourceExt>(obj: &K) -> Result<String> {
    obj.namespace()
        .ok_or_else(|| Error::validation(format!("{} has no namespace", obj.name_any())))
}

fn ignore_missing<T>(result: std::result::Result<T, kube::Error>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn set_finalizers(
    api: &Api<RemoteSyncer>,
    name: &str,
    finalizers: Vec<String>,
) -> Result<()> {
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_remote_syncer(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RemoteSyncer>> {
        Ok(self.namespaced::<RemoteSyncer>(namespace).get_opt(name).await?)
    }

    async fn list_remote_syncers(&self, namespace: &str) -> Result<Vec<RemoteSyncer>> {
        let list = self
            .namespaced::<RemoteSyncer>(namespace)
            .list(&ListParams::default())
            .await?;
        Ok(list.items)
    }

    async fn replace_remote_syncer_status(&self, syncer: &RemoteSyncer) -> Result<RemoteSyncer> {
        let api = self.namespaced::<RemoteSyncer>(&namespace_of(syncer)?);
        // resourceVersion in a merge patch turns it into a conditional write
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": syncer.resource_version(),
            },
            "status": syncer.status,
        });
        let updated = api
            .patch_status(
                &syncer.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(updated)
    }

    async fn add_remote_syncer_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()> {
        let api = self.namespaced::<RemoteSyncer>(namespace);
        let syncer = api.get(name).await?;
        let mut finalizers = syncer.finalizers().to_vec();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        set_finalizers(&api, name, finalizers).await
    }

    async fn remove_remote_syncer_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()> {
        let api = self.namespaced::<RemoteSyncer>(namespace);
        let Some(syncer) = api.get_opt(name).await? else {
            return Ok(());
        };
        let finalizers: Vec<String> = syncer
            .finalizers()
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect();
        set_finalizers(&api, name, finalizers).await
    }

    async fn get_remote_user(&self, namespace: &str, name: &str) -> Result<Option<RemoteUser>> {
        Ok(self.namespaced::<RemoteUser>(namespace).get_opt(name).await?)
    }

    async fn list_remote_user_bindings(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<RemoteUserBinding>> {
        let list = self
            .namespaced::<RemoteUserBinding>(namespace)
            .list(&list_params(selector))
            .await?;
        Ok(list.items)
    }

    async fn create_remote_user_binding(
        &self,
        binding: &RemoteUserBinding,
    ) -> Result<RemoteUserBinding> {
        let api = self.namespaced::<RemoteUserBinding>(&namespace_of(binding)?);
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(api.create(&pp, binding).await?)
    }

    async fn replace_remote_user_binding(
        &self,
        binding: &RemoteUserBinding,
    ) -> Result<RemoteUserBinding> {
        let api = self.namespaced::<RemoteUserBinding>(&namespace_of(binding)?);
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(api.replace(&binding.name_any(), &pp, binding).await?)
    }

    async fn delete_remote_user_binding(&self, namespace: &str, name: &str) -> Result<()> {
        debug!(namespace, name, "deleting RemoteUserBinding");
        let api = self.namespaced::<RemoteUserBinding>(namespace);
        ignore_missing(api.delete(name, &DeleteParams::default()).await)
    }

    async fn get_remote_target(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RemoteTarget>> {
        Ok(self.namespaced::<RemoteTarget>(namespace).get_opt(name).await?)
    }

    async fn list_remote_targets(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<RemoteTarget>> {
        let list = self
            .namespaced::<RemoteTarget>(namespace)
            .list(&list_params(selector))
            .await?;
        Ok(list.items)
    }

    async fn create_remote_target(&self, target: &RemoteTarget) -> Result<RemoteTarget> {
        let api = self.namespaced::<RemoteTarget>(&namespace_of(target)?);
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(api.create(&pp, target).await?)
    }

    async fn delete_remote_target(&self, namespace: &str, name: &str) -> Result<()> {
        debug!(namespace, name, "deleting RemoteTarget");
        let api = self.namespaced::<RemoteTarget>(namespace);
        ignore_missing(api.delete(name, &DeleteParams::default()).await)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.namespaced::<Secret>(namespace).get_opt(name).await?)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self.namespaced::<ConfigMap>(namespace).get_opt(name).await?)
    }

    async fn list_config_maps(&self, namespace: &str, selector: &str) -> Result<Vec<ConfigMap>> {
        let list = self
            .namespaced::<ConfigMap>(namespace)
            .list(&list_params(selector))
            .await?;
        Ok(list.items)
    }

    async fn review_access(&self, review: &AccessReview) -> Result<AccessDecision> {
        let api: Api<SubjectAccessReview> = Api::all(self.client.clone());
        let request = SubjectAccessReview {
            spec: SubjectAccessReviewSpec {
                user: Some(review.user.clone()),
                uid: review.uid.clone(),
                groups: Some(review.groups.clone()).filter(|g| !g.is_empty()),
                resource_attributes: Some(ResourceAttributes {
                    namespace: review.namespace.clone(),
                    verb: Some(review.verb.clone()),
                    group: Some(review.group.clone()),
                    version: Some(review.version.clone()),
                    resource: Some(review.resource.clone()),
                    name: review.name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let response = api.create(&PostParams::default(), &request).await?;
        let status = response.status.unwrap_or_default();
        Ok(AccessDecision {
            allowed: status.allowed,
            reason: status.reason.unwrap_or_default(),
            evaluation_error: status.evaluation_error.unwrap_or_default(),
        })
    }

    async fn get_webhook_configuration(
        &self,
        name: &str,
    ) -> Result<Option<ValidatingWebhookConfiguration>> {
        let api: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_webhook_configuration(
        &self,
        config: &ValidatingWebhookConfiguration,
    ) -> Result<()> {
        let api: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.create(&pp, config).await?;
        Ok(())
    }

    async fn replace_webhook_configuration(
        &self,
        config: &ValidatingWebhookConfiguration,
    ) -> Result<()> {
        let api: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.replace(&config.name_any(), &pp, config).await?;
        Ok(())
    }
}
