//! RemoteTarget CRD: a concrete push destination

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{LABEL_ALLOW_INJECTION, LABEL_BRANCH, LABEL_MANAGED_BY, LABEL_PATTERN, MANAGED_BY_SYNGIT};

/// RemoteTarget names an upstream (repository, branch) and where pushes actually land
///
/// When the target differs from the upstream, `mergeStrategy` decides how the
/// target branch is brought up to date with the upstream before each commit.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "syngit.io",
    version = "v1beta3",
    kind = "RemoteTarget",
    namespaced,
    shortname = "rt",
    printcolumn = r#"{"name":"Upstream","type":"string","jsonPath":".spec.upstreamRepository"}"#,
    printcolumn = r#"{"name":"UpstreamBranch","type":"string","jsonPath":".spec.upstreamBranch"}"#,
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.targetRepository"}"#,
    printcolumn = r#"{"name":"TargetBranch","type":"string","jsonPath":".spec.targetBranch"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTargetSpec {
    /// Repository the content derives from
    pub upstream_repository: String,

    /// Branch the content derives from
    pub upstream_branch: String,

    /// Repository receiving the push (empty for a fork not yet provisioned)
    #[serde(default)]
    pub target_repository: String,

    /// Branch receiving the push
    pub target_branch: String,

    /// How the target is aligned with the upstream; empty iff upstream == target
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub merge_strategy: Option<MergeStrategy>,
}

/// Alignment policy between a target branch and its upstream
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Fast-forward the target onto the upstream, fail otherwise
    TryFastForwardOrDie,
    /// Fast-forward when possible, otherwise reset the target to the upstream
    TryFastForwardOrHardReset,
    /// Reset the target to the upstream
    TryHardResetOrDie,
}

impl MergeStrategy {
    /// Whether the push must be forced
    pub fn forces_push(&self) -> bool {
        !matches!(self, MergeStrategy::TryFastForwardOrDie)
    }
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeStrategy::TryFastForwardOrDie => write!(f, "TryFastForwardOrDie"),
            MergeStrategy::TryFastForwardOrHardReset => write!(f, "TryFastForwardOrHardReset"),
            MergeStrategy::TryHardResetOrDie => write!(f, "TryHardResetOrDie"),
        }
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<MergeStrategy>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => {
            MergeStrategy::deserialize(serde::de::value::StrDeserializer::<D::Error>::new(value))
                .map(Some)
        }
    }
}

impl RemoteTargetSpec {
    /// Whether the target points at its own upstream
    pub fn is_same_as_upstream(&self) -> bool {
        self.upstream_repository == self.target_repository
            && self.upstream_branch == self.target_branch
    }

    /// Whether the upstream side equals the given repository and branch
    pub fn has_upstream(&self, repository: &str, branch: &str) -> bool {
        self.upstream_repository == repository && self.upstream_branch == branch
    }

    /// Check the merge strategy invariant
    pub fn validate(&self) -> crate::Result<()> {
        match (self.is_same_as_upstream(), self.merge_strategy) {
            (true, Some(_)) => Err(crate::Error::SameUpstreamDifferentMergeStrategy),
            (false, None) => Err(crate::Error::DifferentUpstreamEmptyMergeStrategy),
            _ => Ok(()),
        }
    }
}

impl RemoteTarget {
    /// Pattern label value, if the target was created by a pattern
    pub fn pattern(&self) -> Option<&str> {
        if self.labels().get(LABEL_MANAGED_BY).map(String::as_str) != Some(MANAGED_BY_SYNGIT) {
            return None;
        }
        self.labels().get(LABEL_PATTERN).map(String::as_str)
    }

    /// Branch label value
    pub fn branch_label(&self) -> Option<&str> {
        self.labels().get(LABEL_BRANCH).map(String::as_str)
    }

    /// Whether several subjects may reference this pattern-managed target
    pub fn allows_injection(&self) -> bool {
        super::remote_user::annotation_is_true(self.labels().get(LABEL_ALLOW_INJECTION))
    }
}
