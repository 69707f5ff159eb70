//! Remote user association: a managed RemoteUserBinding per subject
//!
//! A RemoteUser annotated for association is referenced from the requesting
//! user's managed binding, which is created on first use and deleted once it
//! references no RemoteUser anymore.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::info;

use syngit_common::crd::{ObjectRef, RemoteUserBinding, RemoteUserBindingSpec, Subject};
use syngit_common::kube_utils::{sanitize_dns_label, sanitize_label_value};
use syngit_common::{Error, LABEL_K8S_USER, LABEL_MANAGED_BY, MANAGED_BY_SYNGIT};

use super::{Pattern, PatternError};
use crate::cluster::ClusterClient;

/// Name prefix of managed bindings
pub const ASSOCIATED_BINDING_PREFIX: &str = "associated-rub";

const MAX_NAME_ATTEMPTS: usize = 20;

/// Selector of the managed bindings of `username`
pub fn managed_binding_selector(username: &str) -> String {
    format!(
        "{}={},{}={}",
        LABEL_MANAGED_BY,
        MANAGED_BY_SYNGIT,
        LABEL_K8S_USER,
        sanitize_label_value(username)
    )
}

/// Managed bindings of `username`
///
/// The selector narrows the listing; the subject check rules out users whose
/// names share the same label value.
pub async fn managed_bindings(
    cluster: &dyn ClusterClient,
    namespace: &str,
    username: &str,
) -> syngit_common::Result<Vec<RemoteUserBinding>> {
    Ok(cluster
        .list_remote_user_bindings(namespace, &managed_binding_selector(username))
        .await?
        .into_iter()
        .filter(|b| b.is_managed_for(username))
        .collect())
}

fn candidate_name(username: &str, attempt: usize) -> String {
    let base = format!("{}-{}", ASSOCIATED_BINDING_PREFIX, sanitize_dns_label(username));
    if attempt == 0 {
        base
    } else {
        format!("{}-{}", base, attempt)
    }
}

/// Association pattern for one RemoteUser and one requesting user
pub struct RemoteUserAssociationPattern<'a> {
    cluster: &'a dyn ClusterClient,
    namespace: String,
    username: String,
    remote_user: String,
    associate: bool,
    existing: Option<RemoteUserBinding>,
    create: bool,
    link: bool,
    to_unlink: Vec<RemoteUserBinding>,
}

impl<'a> RemoteUserAssociationPattern<'a> {
    /// Pattern (dis)associating `remote_user` for `username`
    pub fn new(
        cluster: &'a dyn ClusterClient,
        namespace: impl Into<String>,
        username: impl Into<String>,
        remote_user: impl Into<String>,
        associate: bool,
    ) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            username: username.into(),
            remote_user: remote_user.into(),
            associate,
            existing: None,
            create: false,
            link: false,
            to_unlink: Vec::new(),
        }
    }

    fn new_binding(&self, name: String) -> RemoteUserBinding {
        RemoteUserBinding {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([
                    (LABEL_MANAGED_BY.to_string(), MANAGED_BY_SYNGIT.to_string()),
                    (LABEL_K8S_USER.to_string(), sanitize_label_value(&self.username)),
                ])),
                ..Default::default()
            },
            spec: RemoteUserBindingSpec {
                subject: Subject::user(self.username.clone()),
                remote_user_refs: vec![ObjectRef::new(self.remote_user.clone())],
                remote_target_refs: vec![],
            },
        }
    }
}

#[async_trait]
impl Pattern for RemoteUserAssociationPattern<'_> {
    fn name(&self) -> &'static str {
        "remote-user-association"
    }

    async fn diff(&mut self) -> Result<bool, PatternError> {
        let mut own = managed_bindings(self.cluster, &self.namespace, &self.username).await?;
        if own.len() > 1 {
            return Err(PatternError::Denied(
                Error::MultipleRemoteUserBinding {
                    user: self.username.clone(),
                    count: own.len(),
                }
                .to_string(),
            ));
        }
        self.existing = own.pop();

        if self.associate {
            match &self.existing {
                None => self.create = true,
                Some(binding) => self.link = !binding.references_user(&self.remote_user),
            }
            return Ok(self.create || self.link);
        }

        let managed = self
            .cluster
            .list_remote_user_bindings(
                &self.namespace,
                &format!("{}={}", LABEL_MANAGED_BY, MANAGED_BY_SYNGIT),
            )
            .await?;
        self.to_unlink.clear();
        for binding in managed
            .into_iter()
            .filter(|b| b.references_user(&self.remote_user))
        {
            if !binding.spec.subject.matches_username(&self.username) {
                return Err(PatternError::Denied(format!(
                    "the RemoteUser {} is associated with the RemoteUserBinding {} of {}; only that user may dissociate it",
                    self.remote_user,
                    binding.name_any(),
                    binding.spec.subject.name
                )));
            }
            self.to_unlink.push(binding);
        }
        Ok(!self.to_unlink.is_empty())
    }

    async fn remove(&mut self) -> Result<(), PatternError> {
        for mut binding in std::mem::take(&mut self.to_unlink) {
            binding
                .spec
                .remote_user_refs
                .retain(|r| r.name != self.remote_user);
            if binding.spec.remote_user_refs.is_empty() {
                self.cluster
                    .delete_remote_user_binding(&self.namespace, &binding.name_any())
                    .await?;
                info!(binding = %binding.name_any(), user = %self.username, "deleted empty managed RemoteUserBinding");
            } else {
                self.cluster.replace_remote_user_binding(&binding).await?;
            }
        }
        Ok(())
    }

    async fn setup(&mut self) -> Result<(), PatternError> {
        if self.create {
            self.create = false;
            for attempt in 0..MAX_NAME_ATTEMPTS {
                let binding = self.new_binding(candidate_name(&self.username, attempt));
                match self.cluster.create_remote_user_binding(&binding).await {
                    Ok(created) => {
                        info!(binding = %created.name_any(), user = %self.username, "created managed RemoteUserBinding");
                        self.existing = Some(created);
                        return Ok(());
                    }
                    Err(e) if e.is_conflict() => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            return Err(PatternError::Errored(format!(
                "no free RemoteUserBinding name for {} after {} attempts",
                self.username, MAX_NAME_ATTEMPTS
            )));
        }

        if self.link {
            self.link = false;
            if let Some(binding) = self.existing.as_mut() {
                binding
                    .spec
                    .remote_user_refs
                    .push(ObjectRef::new(self.remote_user.clone()));
                let replaced = self.cluster.replace_remote_user_binding(binding).await?;
                self.existing = Some(replaced);
            }
        }
        Ok(())
    }
}
