//! User-specific pattern: one RemoteTarget per user, on a branch or a fork
//!
//! Driven by the `user-specific` annotation of a RemoteSyncer. The managed
//! target is linked to the user's RemoteUserBinding; targets of a mode that is
//! no longer requested are unlinked and deleted once nothing references them.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info};

use syngit_common::crd::{
    MergeStrategy, RemoteSyncer, RemoteTarget, RemoteTargetSpec, RemoteUserBinding,
    UserSpecificMode,
};
use syngit_common::kube_utils::{managed_name, sanitize_label_value};
use syngit_common::{
    LABEL_BRANCH, LABEL_K8S_USER, LABEL_MANAGED_BY, LABEL_PATTERN, MANAGED_BY_SYNGIT,
    PATTERN_ONE_USER_ONE_BRANCH, PATTERN_ONE_USER_ONE_FORK,
};

use super::{Pattern, PatternError};
use crate::cluster::ClusterClient;

/// Branch name derived from a user name
///
/// Characters Git refuses in ref names become `-`.
pub fn user_branch(username: &str) -> String {
    username
        .chars()
        .map(|c| match c {
            '~' | '^' | ':' | '?' | '*' | '[' | '\\' | ' ' => '-',
            c if c.is_control() => '-',
            c => c,
        })
        .collect()
}

/// The RemoteTarget a user gets under `mode`
pub fn user_target(syncer: &RemoteSyncer, username: &str, mode: UserSpecificMode) -> RemoteTarget {
    let upstream_repository = syncer.spec.remote_repository.clone();
    let upstream_branch = syncer.spec.default_branch.clone();
    let (target_repository, target_branch) = match mode {
        UserSpecificMode::OneUserOneBranch => (upstream_repository.clone(), user_branch(username)),
        UserSpecificMode::OneUserOneFork => (String::new(), upstream_branch.clone()),
    };

    let name = managed_name(
        "rt",
        username,
        &[
            &upstream_repository,
            &upstream_branch,
            &target_repository,
            username,
        ],
    );
    let labels = BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY_SYNGIT.to_string()),
        (LABEL_PATTERN.to_string(), mode.pattern_label().to_string()),
        (LABEL_BRANCH.to_string(), sanitize_label_value(&target_branch)),
        (LABEL_K8S_USER.to_string(), sanitize_label_value(username)),
    ]);

    RemoteTarget {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: syncer.namespace(),
            labels: Some(labels),
            ..Default::default()
        },
        spec: RemoteTargetSpec {
            upstream_repository,
            upstream_branch,
            target_repository,
            target_branch,
            merge_strategy: Some(MergeStrategy::TryFastForwardOrHardReset),
        },
    }
}

fn is_user_specific(target: &RemoteTarget) -> bool {
    matches!(
        target.pattern(),
        Some(PATTERN_ONE_USER_ONE_BRANCH) | Some(PATTERN_ONE_USER_ONE_FORK)
    )
}

/// User-specific pattern for one user and one RemoteSyncer
pub struct UserSpecificPattern<'a> {
    cluster: &'a dyn ClusterClient,
    syncer: &'a RemoteSyncer,
    username: String,
    binding: RemoteUserBinding,
    to_remove: Vec<RemoteTarget>,
    to_create: Option<RemoteTarget>,
    to_link: Option<String>,
}

impl<'a> UserSpecificPattern<'a> {
    /// Pattern acting on `binding`, the binding of `username`
    pub fn new(
        cluster: &'a dyn ClusterClient,
        syncer: &'a RemoteSyncer,
        username: impl Into<String>,
        binding: RemoteUserBinding,
    ) -> Self {
        Self {
            cluster,
            syncer,
            username: username.into(),
            binding,
            to_remove: Vec::new(),
            to_create: None,
            to_link: None,
        }
    }

    /// The binding as left by the last phase
    pub fn binding(&self) -> &RemoteUserBinding {
        &self.binding
    }

    /// Consume the pattern, keeping the binding
    pub fn into_binding(self) -> RemoteUserBinding {
        self.binding
    }

    fn namespace(&self) -> String {
        self.syncer.namespace().unwrap_or_default()
    }

    /// Store the binding, when it is the user's managed one
    ///
    /// A binding written by hand only changes for the current request.
    async fn persist_binding(&mut self) -> Result<(), PatternError> {
        if !self.binding.is_managed_for(&self.username) {
            debug!(binding = %self.binding.name_any(), "binding is not managed, not storing it");
            return Ok(());
        }
        self.binding = self.cluster.replace_remote_user_binding(&self.binding).await?;
        Ok(())
    }

    /// Whether `target` is one of the targets this user gets on this syncer
    fn owns(&self, target: &RemoteTarget) -> bool {
        let name = target.name_any();
        [UserSpecificMode::OneUserOneBranch, UserSpecificMode::OneUserOneFork]
            .into_iter()
            .any(|mode| user_target(self.syncer, &self.username, mode).name_any() == name)
    }

    /// Managed user-specific targets of this user on the syncer's upstream
    async fn existing_targets(&self) -> Result<Vec<RemoteTarget>, PatternError> {
        let namespace = self.namespace();
        let mut found = Vec::new();
        for reference in &self.binding.spec.remote_target_refs {
            let Some(target) = self
                .cluster
                .get_remote_target(&namespace, &reference.name)
                .await?
            else {
                continue;
            };
            if self.owns(&target)
                && is_user_specific(&target)
                && target.spec.has_upstream(
                    &self.syncer.spec.remote_repository,
                    &self.syncer.spec.default_branch,
                )
            {
                found.push(target);
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl Pattern for UserSpecificPattern<'_> {
    fn name(&self) -> &'static str {
        "user-specific"
    }

    async fn diff(&mut self) -> Result<bool, PatternError> {
        let mode = self.syncer.user_specific_mode()?;
        let existing = self.existing_targets().await?;

        let Some(mode) = mode else {
            self.to_remove = existing;
            return Ok(!self.to_remove.is_empty());
        };

        let desired = user_target(self.syncer, &self.username, mode);
        let desired_name = desired.name_any();
        self.to_remove = existing
            .into_iter()
            .filter(|t| t.name_any() != desired_name)
            .collect();
        self.to_create = match self
            .cluster
            .get_remote_target(&self.namespace(), &desired_name)
            .await?
        {
            Some(_) => None,
            None => Some(desired),
        };
        self.to_link = (!self.binding.references_target(&desired_name)).then_some(desired_name);

        Ok(!self.to_remove.is_empty() || self.to_create.is_some() || self.to_link.is_some())
    }

    async fn remove(&mut self) -> Result<(), PatternError> {
        if self.to_remove.is_empty() {
            return Ok(());
        }
        let mut changed = false;
        for target in &self.to_remove {
            changed |= self.binding.unlink_target(&target.name_any());
        }
        if changed {
            self.persist_binding().await?;
        }

        let namespace = self.namespace();
        let bindings = self.cluster.list_remote_user_bindings(&namespace, "").await?;
        for target in std::mem::take(&mut self.to_remove) {
            let name = target.name_any();
            if bindings.iter().any(|b| b.references_target(&name)) {
                debug!(target = %name, "RemoteTarget still referenced, keeping it");
                continue;
            }
            self.cluster.delete_remote_target(&namespace, &name).await?;
            info!(target = %name, user = %self.username, "deleted user-specific RemoteTarget");
        }
        Ok(())
    }

    async fn setup(&mut self) -> Result<(), PatternError> {
        if let Some(target) = self.to_create.take() {
            match self.cluster.create_remote_target(&target).await {
                Ok(_) => {
                    info!(target = %target.name_any(), user = %self.username, "created user-specific RemoteTarget")
                }
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(name) = self.to_link.take() {
            if self.binding.link_target(&name) {
                self.persist_binding().await?;
            }
        }
        Ok(())
    }
}
