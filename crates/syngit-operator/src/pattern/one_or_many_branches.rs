//! One-or-many-branches pattern: one RemoteTarget per listed branch
//!
//! Driven by the `one-or-many-branches` annotation of a RemoteSyncer. Every
//! listed branch gets a RemoteTarget deriving from the syncer's upstream, and
//! every managed RemoteUserBinding of the namespace is linked to all of them.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info};

use syngit_common::crd::{MergeStrategy, RemoteSyncer, RemoteTarget, RemoteTargetSpec, RemoteUserBinding};
use syngit_common::kube_utils::{managed_name, sanitize_label_value};
use syngit_common::{
    LABEL_BRANCH, LABEL_MANAGED_BY, LABEL_PATTERN, MANAGED_BY_SYNGIT, PATTERN_ONE_OR_MANY_BRANCHES,
};

use super::{Pattern, PatternError};
use crate::cluster::ClusterClient;

/// The RemoteTarget pushing `syncer`'s upstream to `branch` of the same repository
pub fn branch_target(syncer: &RemoteSyncer, branch: &str) -> RemoteTarget {
    let repository = syncer.spec.remote_repository.clone();
    let upstream_branch = syncer.spec.default_branch.clone();
    let name = managed_name("rt", branch, &[&repository, &upstream_branch, &repository, branch]);
    let merge_strategy =
        (branch != upstream_branch).then_some(MergeStrategy::TryFastForwardOrHardReset);
    let labels = BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY_SYNGIT.to_string()),
        (LABEL_PATTERN.to_string(), PATTERN_ONE_OR_MANY_BRANCHES.to_string()),
        (LABEL_BRANCH.to_string(), sanitize_label_value(branch)),
    ]);

    RemoteTarget {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: syncer.namespace(),
            labels: Some(labels),
            ..Default::default()
        },
        spec: RemoteTargetSpec {
            upstream_repository: repository.clone(),
            upstream_branch,
            target_repository: repository,
            target_branch: branch.to_string(),
            merge_strategy,
        },
    }
}

fn desired_targets(syncer: Option<&RemoteSyncer>) -> Vec<RemoteTarget> {
    syncer
        .map(|s| {
            s.pattern_branches()
                .iter()
                .map(|b| branch_target(s, b))
                .collect()
        })
        .unwrap_or_default()
}

fn managed_selector() -> String {
    format!("{}={}", LABEL_MANAGED_BY, MANAGED_BY_SYNGIT)
}

/// One-or-many-branches pattern for a RemoteSyncer transition
///
/// `previous` is the stored object (absent on creation), `current` the
/// submitted one (absent on deletion).
pub struct OneOrManyBranchesPattern<'a> {
    cluster: &'a dyn ClusterClient,
    namespace: String,
    current: Option<&'a RemoteSyncer>,
    previous: Option<&'a RemoteSyncer>,
    desired: Vec<String>,
    to_remove: Vec<String>,
    to_create: Vec<RemoteTarget>,
}

impl<'a> OneOrManyBranchesPattern<'a> {
    /// Pattern for the transition `previous` -> `current` in `namespace`
    pub fn new(
        cluster: &'a dyn ClusterClient,
        namespace: impl Into<String>,
        current: Option<&'a RemoteSyncer>,
        previous: Option<&'a RemoteSyncer>,
    ) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            current,
            previous,
            desired: Vec::new(),
            to_remove: Vec::new(),
            to_create: Vec::new(),
        }
    }

    fn syncer_name(&self) -> Option<String> {
        self.current.or(self.previous).map(|s| s.name_any())
    }

    /// Whether another RemoteSyncer of the namespace still wants `target`
    async fn wanted_elsewhere(&self, target: &str) -> Result<bool, PatternError> {
        let own = self.syncer_name();
        let others = self.cluster.list_remote_syncers(&self.namespace).await?;
        Ok(others
            .iter()
            .filter(|s| Some(s.name_any()) != own)
            .any(|s| desired_targets(Some(s)).iter().any(|t| t.name_any() == target)))
    }

    async fn managed_bindings(&self) -> Result<Vec<RemoteUserBinding>, PatternError> {
        Ok(self
            .cluster
            .list_remote_user_bindings(&self.namespace, &managed_selector())
            .await?)
    }
}

#[async_trait]
impl Pattern for OneOrManyBranchesPattern<'_> {
    fn name(&self) -> &'static str {
        "one-or-many-branches"
    }

    async fn diff(&mut self) -> Result<bool, PatternError> {
        let desired = desired_targets(self.current);
        self.desired = desired.iter().map(|t| t.name_any()).collect();

        self.to_remove.clear();
        for stale in desired_targets(self.previous) {
            let name = stale.name_any();
            if self.desired.contains(&name) {
                continue;
            }
            let Some(live) = self.cluster.get_remote_target(&self.namespace, &name).await? else {
                continue;
            };
            if live.pattern() != Some(PATTERN_ONE_OR_MANY_BRANCHES) {
                continue;
            }
            if self.wanted_elsewhere(&name).await? {
                debug!(target = %name, "branch still listed by another RemoteSyncer");
                continue;
            }
            self.to_remove.push(name);
        }

        self.to_create.clear();
        for target in desired {
            if self
                .cluster
                .get_remote_target(&self.namespace, &target.name_any())
                .await?
                .is_none()
            {
                self.to_create.push(target);
            }
        }

        let bindings = self.managed_bindings().await?;
        let needs_link = bindings
            .iter()
            .any(|b| self.desired.iter().any(|t| !b.references_target(t)));

        Ok(!self.to_remove.is_empty() || !self.to_create.is_empty() || needs_link)
    }

    async fn remove(&mut self) -> Result<(), PatternError> {
        if self.to_remove.is_empty() {
            return Ok(());
        }
        for mut binding in self.managed_bindings().await? {
            let mut changed = false;
            for name in &self.to_remove {
                changed |= binding.unlink_target(name);
            }
            if changed {
                self.cluster.replace_remote_user_binding(&binding).await?;
            }
        }
        for name in std::mem::take(&mut self.to_remove) {
            self.cluster.delete_remote_target(&self.namespace, &name).await?;
            info!(target = %name, namespace = %self.namespace, "deleted branch RemoteTarget");
        }
        Ok(())
    }

    async fn setup(&mut self) -> Result<(), PatternError> {
        for target in std::mem::take(&mut self.to_create) {
            match self.cluster.create_remote_target(&target).await {
                Ok(_) => info!(
                    target = %target.name_any(),
                    branch = %target.spec.target_branch,
                    "created branch RemoteTarget"
                ),
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e.into()),
            }
        }
        for mut binding in self.managed_bindings().await? {
            let mut changed = false;
            for name in &self.desired {
                changed |= binding.link_target(name);
            }
            if changed {
                self.cluster.replace_remote_user_binding(&binding).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{trigger, PatternState};
    use crate::testing::{binding, syncer, FakeCluster};
    use syngit_common::{ANNOTATION_ONE_OR_MANY_BRANCHES, LABEL_K8S_USER};

    const REPO: &str = "https://git.example.com/platform/cluster.git";

    fn with_branches(name: &str, branches: &str) -> RemoteSyncer {
        let mut rsy = syncer(name, REPO);
        rsy.annotations_mut().insert(
            ANNOTATION_ONE_OR_MANY_BRANCHES.to_string(),
            branches.to_string(),
        );
        rsy
    }

    fn managed_binding(user: &str) -> RemoteUserBinding {
        let mut rub = binding(&format!("associated-rub-{}", user), user, &[], &[]);
        rub.labels_mut()
            .insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_SYNGIT.to_string());
        rub.labels_mut()
            .insert(LABEL_K8S_USER.to_string(), user.to_string());
        rub
    }

    async fn run(
        cluster: &FakeCluster,
        current: Option<&RemoteSyncer>,
        previous: Option<&RemoteSyncer>,
    ) -> PatternState {
        let mut pattern = OneOrManyBranchesPattern::new(cluster, "test", current, previous);
        trigger(&mut pattern).await.unwrap()
    }

    fn branches(cluster: &FakeCluster) -> Vec<String> {
        let mut branches: Vec<String> = cluster
            .targets("test")
            .iter()
            .map(|t| t.spec.target_branch.clone())
            .collect();
        branches.sort();
        branches
    }

    #[test]
    fn the_default_branch_targets_the_upstream_itself() {
        let rsy = syncer("rsy", REPO);
        let main = branch_target(&rsy, "main");
        let feature = branch_target(&rsy, "feature");
        assert!(main.spec.is_same_as_upstream());
        assert!(main.spec.validate().is_ok());
        assert_eq!(
            feature.spec.merge_strategy,
            Some(MergeStrategy::TryFastForwardOrHardReset)
        );
        assert!(feature.spec.validate().is_ok());
        assert_eq!(feature.pattern(), Some(PATTERN_ONE_OR_MANY_BRANCHES));
    }

    /// Story: listed branches become targets linked to every managed binding
    #[tokio::test]
    async fn story_branches_are_materialized_and_linked() {
        let cluster = FakeCluster::new();
        cluster.add_binding(managed_binding("luffy"));
        cluster.add_binding(managed_binding("zoro"));
        cluster.add_binding(binding("manual", "nami", &[], &[]));
        let rsy = with_branches("rsy", "br1, br2");

        assert_eq!(run(&cluster, Some(&rsy), None).await, PatternState::Done);
        assert_eq!(branches(&cluster), vec!["br1", "br2"]);
        for rub in cluster.bindings("test") {
            let expected = if rub.is_managed() { 2 } else { 0 };
            assert_eq!(rub.spec.remote_target_refs.len(), expected);
        }

        assert_eq!(run(&cluster, Some(&rsy), Some(&rsy)).await, PatternState::Clean);
    }

    /// Story: dropping a branch deletes its target unless another syncer lists it
    #[tokio::test]
    async fn story_removed_branches_are_cleaned_up() {
        let cluster = FakeCluster::new();
        cluster.add_binding(managed_binding("luffy"));
        let before = with_branches("rsy", "br1,br2,br3");
        cluster.add_syncer(before.clone());
        run(&cluster, Some(&before), None).await;

        cluster.add_syncer(with_branches("other", "br3"));
        let after = with_branches("rsy", "br1");
        cluster.add_syncer(after.clone());
        run(&cluster, Some(&after), Some(&before)).await;

        assert_eq!(branches(&cluster), vec!["br1", "br3"]);
        let rub = &cluster.bindings("test")[0];
        let br2 = branch_target(&after, "br2").name_any();
        let br3 = branch_target(&after, "br3").name_any();
        assert!(!rub.references_target(&br2));
        assert!(rub.references_target(&br3));
    }

    #[tokio::test]
    async fn deleting_the_syncer_removes_its_targets() {
        let cluster = FakeCluster::new();
        cluster.add_binding(managed_binding("luffy"));
        let rsy = with_branches("rsy", "br1");
        run(&cluster, Some(&rsy), None).await;

        run(&cluster, None, Some(&rsy)).await;
        assert!(cluster.targets("test").is_empty());
        assert!(cluster.bindings("test")[0].spec.remote_target_refs.is_empty());
    }
}
