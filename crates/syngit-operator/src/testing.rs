//! In-memory cluster for stateful tests
//!
//! `MockClusterClient` fits single-call expectations; the patterns and the
//! pipeline read what they just wrote, so their scenarios run against this
//! fake instead.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::ResourceExt;

use syngit_common::crd::{
    ObjectRef, RemoteSyncer, RemoteSyncerSpec, RemoteTarget, RemoteTargetSpec, RemoteUser,
    RemoteUserBinding, RemoteUserBindingSpec, RemoteUserSpec, ScopedResources, Subject,
};
use syngit_common::kube_utils::{parse_equality_selector, sanitize_label_value};
use syngit_common::{Error, Result, LABEL_K8S_USER, LABEL_MANAGED_BY, MANAGED_BY_SYNGIT};

use crate::cluster::{AccessDecision, AccessReview, ClusterClient};

type Key = (String, String);

#[derive(Default)]
struct State {
    syncers: BTreeMap<Key, RemoteSyncer>,
    users: BTreeMap<Key, RemoteUser>,
    bindings: BTreeMap<Key, RemoteUserBinding>,
    targets: BTreeMap<Key, RemoteTarget>,
    secrets: BTreeMap<Key, Secret>,
    config_maps: BTreeMap<Key, ConfigMap>,
    webhook: Option<ValidatingWebhookConfiguration>,
    denied: Vec<(String, String, String)>,
    unknown_resources: Vec<String>,
    pending_conflicts: u32,
    next_version: u64,
    status_writes: u32,
}

impl State {
    fn version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

/// Cluster kept in memory
#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<State>,
}

fn key<K: ResourceExt>(obj: &K) -> Key {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

fn k(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn selected<K: ResourceExt>(obj: &K, namespace: &str, selector: &str) -> bool {
    if obj.namespace().as_deref() != Some(namespace) {
        return false;
    }
    let labels = obj.labels();
    parse_equality_selector(selector)
        .iter()
        .all(|(k, v)| labels.get(k) == Some(v))
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::from(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub(crate) fn add_syncer(&self, mut syncer: RemoteSyncer) {
        self.with(|s| {
            syncer.metadata.resource_version = Some(s.version());
            s.syncers.insert(key(&syncer), syncer);
        });
    }

    pub(crate) fn add_user(&self, user: RemoteUser) {
        self.with(|s| {
            s.users.insert(key(&user), user);
        });
    }

    pub(crate) fn add_binding(&self, binding: RemoteUserBinding) {
        self.with(|s| {
            s.bindings.insert(key(&binding), binding);
        });
    }

    pub(crate) fn add_target(&self, target: RemoteTarget) {
        self.with(|s| {
            s.targets.insert(key(&target), target);
        });
    }

    pub(crate) fn add_secret(&self, secret: Secret) {
        self.with(|s| {
            s.secrets.insert(key(&secret), secret);
        });
    }

    pub(crate) fn add_config_map(&self, cm: ConfigMap) {
        self.with(|s| {
            s.config_maps.insert(key(&cm), cm);
        });
    }

    /// Make the authorizer refuse `verb` on `resource` for `user`
    pub(crate) fn deny_access(&self, user: &str, verb: &str, resource: &str) {
        self.with(|s| {
            s.denied
                .push((user.to_string(), verb.to_string(), resource.to_string()))
        });
    }

    /// Make reviews on `resource` fail with a "no matches for kind" evaluation error
    pub(crate) fn unknown_resource(&self, resource: &str) {
        self.with(|s| s.unknown_resources.push(resource.to_string()));
    }

    /// Fail the next `n` status writes with a conflict
    pub(crate) fn conflict_next_status_writes(&self, n: u32) {
        self.with(|s| s.pending_conflicts = n);
    }

    pub(crate) fn status_writes(&self) -> u32 {
        self.with(|s| s.status_writes)
    }

    pub(crate) fn syncer(&self, namespace: &str, name: &str) -> Option<RemoteSyncer> {
        self.with(|s| s.syncers.get(&k(namespace, name)).cloned())
    }

    pub(crate) fn bindings(&self, namespace: &str) -> Vec<RemoteUserBinding> {
        self.with(|s| {
            s.bindings
                .values()
                .filter(|b| b.namespace().as_deref() == Some(namespace))
                .cloned()
                .collect()
        })
    }

    pub(crate) fn targets(&self, namespace: &str) -> Vec<RemoteTarget> {
        self.with(|s| {
            s.targets
                .values()
                .filter(|t| t.namespace().as_deref() == Some(namespace))
                .cloned()
                .collect()
        })
    }

    pub(crate) fn webhook(&self) -> Option<ValidatingWebhookConfiguration> {
        self.with(|s| s.webhook.clone())
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_remote_syncer(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RemoteSyncer>> {
        Ok(self.syncer(namespace, name))
    }

    async fn list_remote_syncers(&self, namespace: &str) -> Result<Vec<RemoteSyncer>> {
        Ok(self.with(|s| {
            s.syncers
                .values()
                .filter(|r| r.namespace().as_deref() == Some(namespace))
                .cloned()
                .collect()
        }))
    }

    async fn replace_remote_syncer_status(&self, syncer: &RemoteSyncer) -> Result<RemoteSyncer> {
        self.with(|s| {
            s.status_writes += 1;
            if s.pending_conflicts > 0 {
                s.pending_conflicts -= 1;
                return Err(api_error(409, "Conflict", "the object has been modified".into()));
            }
            let version = s.version();
            let stored = s
                .syncers
                .get_mut(&key(syncer))
                .ok_or_else(|| api_error(404, "NotFound", syncer.name_any()))?;
            if stored.metadata.resource_version != syncer.metadata.resource_version {
                return Err(api_error(409, "Conflict", "stale resourceVersion".into()));
            }
            stored.status = syncer.status.clone();
            stored.metadata.resource_version = Some(version);
            Ok(stored.clone())
        })
    }

    async fn add_remote_syncer_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()> {
        self.with(|s| {
            let stored = s
                .syncers
                .get_mut(&k(namespace, name))
                .ok_or_else(|| api_error(404, "NotFound", name.to_string()))?;
            let finalizers = stored.metadata.finalizers.get_or_insert_with(Vec::new);
            if !finalizers.iter().any(|f| f == finalizer) {
                finalizers.push(finalizer.to_string());
            }
            Ok(())
        })
    }

    async fn remove_remote_syncer_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()> {
        self.with(|s| {
            if let Some(stored) = s.syncers.get_mut(&k(namespace, name)) {
                if let Some(finalizers) = stored.metadata.finalizers.as_mut() {
                    finalizers.retain(|f| f != finalizer);
                }
            }
            Ok(())
        })
    }

    async fn get_remote_user(&self, namespace: &str, name: &str) -> Result<Option<RemoteUser>> {
        Ok(self.with(|s| s.users.get(&k(namespace, name)).cloned()))
    }

    async fn list_remote_user_bindings(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<RemoteUserBinding>> {
        Ok(self.with(|s| {
            s.bindings
                .values()
                .filter(|b| selected(*b, namespace, selector))
                .cloned()
                .collect()
        }))
    }

    async fn create_remote_user_binding(
        &self,
        binding: &RemoteUserBinding,
    ) -> Result<RemoteUserBinding> {
        self.with(|s| {
            if s.bindings.contains_key(&key(binding)) {
                return Err(api_error(409, "AlreadyExists", binding.name_any()));
            }
            s.bindings.insert(key(binding), binding.clone());
            Ok(binding.clone())
        })
    }

    async fn replace_remote_user_binding(
        &self,
        binding: &RemoteUserBinding,
    ) -> Result<RemoteUserBinding> {
        self.with(|s| {
            if !s.bindings.contains_key(&key(binding)) {
                return Err(api_error(404, "NotFound", binding.name_any()));
            }
            s.bindings.insert(key(binding), binding.clone());
            Ok(binding.clone())
        })
    }

    async fn delete_remote_user_binding(&self, namespace: &str, name: &str) -> Result<()> {
        self.with(|s| s.bindings.remove(&k(namespace, name)));
        Ok(())
    }

    async fn get_remote_target(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RemoteTarget>> {
        Ok(self.with(|s| s.targets.get(&k(namespace, name)).cloned()))
    }

    async fn list_remote_targets(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<RemoteTarget>> {
        Ok(self.with(|s| {
            s.targets
                .values()
                .filter(|t| selected(*t, namespace, selector))
                .cloned()
                .collect()
        }))
    }

    async fn create_remote_target(&self, target: &RemoteTarget) -> Result<RemoteTarget> {
        self.with(|s| {
            if s.targets.contains_key(&key(target)) {
                return Err(api_error(409, "AlreadyExists", target.name_any()));
            }
            s.targets.insert(key(target), target.clone());
            Ok(target.clone())
        })
    }

    async fn delete_remote_target(&self, namespace: &str, name: &str) -> Result<()> {
        self.with(|s| s.targets.remove(&k(namespace, name)));
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.with(|s| s.secrets.get(&k(namespace, name)).cloned()))
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self.with(|s| s.config_maps.get(&k(namespace, name)).cloned()))
    }

    async fn list_config_maps(&self, namespace: &str, selector: &str) -> Result<Vec<ConfigMap>> {
        Ok(self.with(|s| {
            s.config_maps
                .values()
                .filter(|c| selected(*c, namespace, selector))
                .cloned()
                .collect()
        }))
    }

    async fn review_access(&self, review: &AccessReview) -> Result<AccessDecision> {
        Ok(self.with(|s| {
            if s.unknown_resources.contains(&review.resource) {
                return AccessDecision {
                    allowed: false,
                    reason: String::new(),
                    evaluation_error: format!(
                        "no matches for kind {} in version {}",
                        review.resource, review.version
                    ),
                };
            }
            let denied = s.denied.iter().any(|(user, verb, resource)| {
                user == &review.user && verb == &review.verb && resource == &review.resource
            });
            AccessDecision {
                allowed: !denied,
                reason: if denied { "RBAC: denied".to_string() } else { String::new() },
                evaluation_error: String::new(),
            }
        }))
    }

    async fn get_webhook_configuration(
        &self,
        _name: &str,
    ) -> Result<Option<ValidatingWebhookConfiguration>> {
        Ok(self.webhook())
    }

    async fn create_webhook_configuration(
        &self,
        config: &ValidatingWebhookConfiguration,
    ) -> Result<()> {
        self.with(|s| {
            if s.webhook.is_some() {
                return Err(api_error(409, "AlreadyExists", config.name_any()));
            }
            let mut config = config.clone();
            config.metadata.resource_version = Some(s.version());
            s.webhook = Some(config);
            Ok(())
        })
    }

    async fn replace_webhook_configuration(
        &self,
        config: &ValidatingWebhookConfiguration,
    ) -> Result<()> {
        self.with(|s| {
            let current = s.webhook.as_ref().map(|w| w.metadata.resource_version.clone());
            if current != Some(config.metadata.resource_version.clone()) {
                return Err(api_error(409, "Conflict", config.name_any()));
            }
            let mut config = config.clone();
            config.metadata.resource_version = Some(s.version());
            s.webhook = Some(config);
            Ok(())
        })
    }
}

// =============================================================================
// Object builders
// =============================================================================

fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// RemoteSyncer in `test` intercepting ConfigMap writes on `repository`/main
pub(crate) fn syncer(name: &str, repository: &str) -> RemoteSyncer {
    let rules = serde_json::from_value(serde_json::json!([{
        "apiGroups": [""],
        "apiVersions": ["v1"],
        "resources": ["configmaps"],
        "operations": ["CREATE", "UPDATE", "DELETE"],
    }]))
    .unwrap();
    RemoteSyncer {
        metadata: meta("test", name),
        spec: RemoteSyncerSpec {
            remote_repository: repository.to_string(),
            default_branch: "main".to_string(),
            strategy: Default::default(),
            target_strategy: Default::default(),
            remote_user_binding_selector: None,
            remote_target_selector: None,
            excluded_fields: vec![],
            excluded_fields_config_map_ref: None,
            default_unauthorized_user_mode: Default::default(),
            default_remote_user_ref: None,
            default_remote_target_ref: None,
            default_block_applied_message: None,
            bypass_interception_subjects: vec![],
            insecure_skip_tls_verify: false,
            ca_bundle_secret_ref: None,
            root_path: None,
            scoped_resources: ScopedResources { rules },
        },
        status: None,
    }
}

/// RemoteUser in `test` for `host` whose secret is `<name>-creds`
pub(crate) fn remote_user(name: &str, host: &str) -> RemoteUser {
    RemoteUser {
        metadata: meta("test", name),
        spec: RemoteUserSpec {
            email: format!("{}@example.com", name),
            git_base_domain_fqdn: host.to_string(),
            secret_ref: ObjectRef::new(format!("{}-creds", name)),
        },
    }
}

/// basic-auth Secret in `test`
pub(crate) fn basic_auth(name: &str, username: &str, password: Option<&str>) -> Secret {
    let mut data = BTreeMap::new();
    data.insert("username".to_string(), ByteString(username.as_bytes().to_vec()));
    if let Some(password) = password {
        data.insert("password".to_string(), ByteString(password.as_bytes().to_vec()));
    }
    Secret {
        metadata: meta("test", name),
        type_: Some("kubernetes.io/basic-auth".to_string()),
        data: Some(data),
        ..Default::default()
    }
}

/// RemoteUserBinding in `test` for `user`
pub(crate) fn binding(name: &str, user: &str, users: &[&str], targets: &[&str]) -> RemoteUserBinding {
    RemoteUserBinding {
        metadata: meta("test", name),
        spec: RemoteUserBindingSpec {
            subject: Subject::user(user),
            remote_user_refs: users.iter().map(|u| ObjectRef::new(*u)).collect(),
            remote_target_refs: targets.iter().map(|t| ObjectRef::new(*t)).collect(),
        },
    }
}

/// RemoteUserBinding in `test` managed by syngit on behalf of `user`
pub(crate) fn managed_binding(
    name: &str,
    user: &str,
    users: &[&str],
    targets: &[&str],
) -> RemoteUserBinding {
    let mut rub = binding(name, user, users, targets);
    rub.labels_mut()
        .insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_SYNGIT.to_string());
    rub.labels_mut()
        .insert(LABEL_K8S_USER.to_string(), sanitize_label_value(user));
    rub
}

/// RemoteTarget in `test` pushing to the upstream itself
pub(crate) fn same_target(name: &str, repository: &str, branch: &str) -> RemoteTarget {
    RemoteTarget {
        metadata: meta("test", name),
        spec: RemoteTargetSpec {
            upstream_repository: repository.to_string(),
            upstream_branch: branch.to_string(),
            target_repository: repository.to_string(),
            target_branch: branch.to_string(),
            merge_strategy: None,
        },
    }
}

/// Fully wired identity: RemoteUser, its Secret and a binding to `targets`
pub(crate) fn seed_identity(cluster: &FakeCluster, user: &str, host: &str, targets: &[&str]) {
    let ru = format!("{}-ru", user);
    cluster.add_user(remote_user(&ru, host));
    cluster.add_secret(basic_auth(&format!("{}-creds", ru), user, Some("token")));
    cluster.add_binding(binding(&format!("{}-rub", user), user, &[&ru], targets));
}

// =============================================================================
// Git remotes
// =============================================================================

/// Bare repository in a temporary directory, seeded with a `main` branch
pub(crate) struct GitRemote {
    _dir: tempfile::TempDir,
    pub(crate) repo: git2::Repository,
    pub(crate) url: String,
}

impl GitRemote {
    pub(crate) fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let repo = git2::Repository::init_bare(dir.path()).unwrap();
        {
            let sig = git2::Signature::now("seed", "seed@example.com").unwrap();
            let blob = repo.blob(b"# cluster\n").unwrap();
            let mut builder = repo.treebuilder(None).unwrap();
            builder.insert("README.md", blob, 0o100644).unwrap();
            let tree = repo.find_tree(builder.write().unwrap()).unwrap();
            repo.commit(Some("refs/heads/main"), &sig, &sig, "init", &tree, &[])
                .unwrap();
        }
        let url = format!("file://localhost{}", dir.path().display());
        Self {
            _dir: dir,
            repo,
            url,
        }
    }

    /// Head of `branch`
    pub(crate) fn head(&self, branch: &str) -> Option<git2::Oid> {
        self.repo
            .refname_to_id(&format!("refs/heads/{}", branch))
            .ok()
    }

    /// Message of the head commit of `branch`
    pub(crate) fn head_message(&self, branch: &str) -> Option<String> {
        let commit = self.repo.find_commit(self.head(branch)?).unwrap();
        commit.message().map(str::to_string)
    }

    /// Content of `path` at the head of `branch`
    pub(crate) fn read(&self, branch: &str, path: &str) -> Option<String> {
        let tree = self.repo.find_commit(self.head(branch)?).unwrap().tree().unwrap();
        let entry = tree.get_path(std::path::Path::new(path)).ok()?;
        let blob = self.repo.find_blob(entry.id()).unwrap();
        Some(String::from_utf8(blob.content().to_vec()).unwrap())
    }
}
