//! RemoteSyncer CRD: the interception policy
//!
//! A RemoteSyncer selects which cluster writes are intercepted and how they are
//! mirrored into Git. Its annotations activate the target patterns.

use chrono::{DateTime, Utc};
use k8s_openapi::api::admissionregistration::v1::RuleWithOperations;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, NamespacedObjectRef, ObjectRef, Subject};
use crate::{ANNOTATION_ONE_OR_MANY_BRANCHES, ANNOTATION_USER_SPECIFIC};

/// RemoteSyncer declares the upstream repository and the intercepted resources.
///
/// Example:
/// ```yaml
/// apiVersion: syngit.io/v1beta3
/// kind: RemoteSyncer
/// metadata:
///   name: configmaps
///   namespace: test
/// spec:
///   remoteRepository: https://git.example.com/platform/cluster.git
///   defaultBranch: main
///   strategy: CommitApply
///   targetStrategy: OneTarget
///   defaultUnauthorizedUserMode: Block
///   excludedFields:
///     - metadata.uid
///     - metadata.managedFields
///   scopedResources:
///     rules:
///       - apiGroups: [""]
///         apiVersions: ["v1"]
///         resources: ["configmaps"]
///         operations: ["CREATE", "UPDATE", "DELETE"]
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "syngit.io",
    version = "v1beta3",
    kind = "RemoteSyncer",
    namespaced,
    status = "RemoteSyncerStatus",
    shortname = "rsy",
    printcolumn = r#"{"name":"Repository","type":"string","jsonPath":".spec.remoteRepository"}"#,
    printcolumn = r#"{"name":"Branch","type":"string","jsonPath":".spec.defaultBranch"}"#,
    printcolumn = r#"{"name":"Strategy","type":"string","jsonPath":".spec.strategy"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSyncerSpec {
    /// Upstream Git repository URL
    pub remote_repository: String,

    /// Upstream branch every RemoteTarget must derive from
    pub default_branch: String,

    /// Whether the intercepted write is applied after the commit
    pub strategy: Strategy,

    /// Whether one or several RemoteTargets may receive the push
    #[serde(default)]
    pub target_strategy: TargetStrategy,

    /// Restricts the RemoteUserBindings considered for identity resolution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_user_binding_selector: Option<LabelSelector>,

    /// Restricts the RemoteTargets considered for target resolution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_target_selector: Option<LabelSelector>,

    /// Field paths removed from the object before it is written to Git
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_fields: Vec<String>,

    /// ConfigMap holding additional excluded field paths
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded_fields_config_map_ref: Option<ObjectRef>,

    /// Behaviour for users without a RemoteUserBinding
    #[serde(default)]
    pub default_unauthorized_user_mode: UnauthorizedUserMode,

    /// RemoteUser used when the requesting user has no binding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_remote_user_ref: Option<ObjectRef>,

    /// RemoteTarget used together with the default RemoteUser
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_remote_target_ref: Option<ObjectRef>,

    /// Denial message returned under the CommitOnly strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_block_applied_message: Option<String>,

    /// Subjects whose writes are recorded but never intercepted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bypass_interception_subjects: Vec<Subject>,

    /// Skip TLS verification of the Git remote
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,

    /// Secret of type `kubernetes.io/tls` holding the CA bundle of the Git host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle_secret_ref: Option<NamespacedObjectRef>,

    /// Directory prefix of every file written to the repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_path: Option<String>,

    /// Intercepted resources and operations
    pub scoped_resources: ScopedResources,
}

/// Intercepted resource rules
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ScopedResources {
    /// Admission rules (apiGroups × apiVersions × resources × operations)
    #[serde(default)]
    pub rules: Vec<RuleWithOperations>,
}

/// What happens to the cluster write after it has been committed
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Strategy {
    /// Commit to Git and deny the cluster write
    CommitOnly,
    /// Commit to Git then allow the cluster write
    #[default]
    CommitApply,
}

/// How many RemoteTargets may receive a single intercepted write
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TargetStrategy {
    /// Exactly one target
    #[default]
    OneTarget,
    /// Any number of targets
    MultipleTarget,
}

/// Behaviour for users without a RemoteUserBinding
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UnauthorizedUserMode {
    /// Deny the write
    #[default]
    Block,
    /// Push with the default RemoteUser to the default RemoteTarget
    UseDefaultUser,
}

/// Mode of the user-specific target pattern
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserSpecificMode {
    /// Each user pushes to a branch named after them
    OneUserOneBranch,
    /// Each user pushes to their own fork
    OneUserOneFork,
}

impl UserSpecificMode {
    /// Annotation value of the mode
    pub fn as_str(&self) -> &'static str {
        match self {
            UserSpecificMode::OneUserOneBranch => "one-user-one-branch",
            UserSpecificMode::OneUserOneFork => "one-user-one-fork",
        }
    }

    /// Pattern label carried by targets created in this mode
    pub fn pattern_label(&self) -> &'static str {
        match self {
            UserSpecificMode::OneUserOneBranch => crate::PATTERN_ONE_USER_ONE_BRANCH,
            UserSpecificMode::OneUserOneFork => crate::PATTERN_ONE_USER_ONE_FORK,
        }
    }
}

impl std::str::FromStr for UserSpecificMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "one-user-one-branch" => Ok(UserSpecificMode::OneUserOneBranch),
            "one-user-one-fork" => Ok(UserSpecificMode::OneUserOneFork),
            other => Err(crate::Error::validation(format!(
                "unknown value {:?} for the annotation {}, expected one-user-one-branch or one-user-one-fork",
                other, ANNOTATION_USER_SPECIFIC
            ))),
        }
    }
}

/// Reference to the object an admission request was about
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObservedObject {
    /// API group of the resource
    #[serde(default)]
    pub group: String,
    /// API version of the resource
    pub version: String,
    /// Plural resource name
    pub resource: String,
    /// Object name
    pub name: String,
    /// Object namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// User that issued an admission request
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObservedUser {
    /// User name
    pub username: String,
    /// User UID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Groups of the user
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

/// Last object seen by the interceptor
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastObservedObjectState {
    /// When the request was observed
    pub last_observed: DateTime<Utc>,
    /// Who issued it
    pub last_user_info: ObservedUser,
    /// What it was about
    pub last_observed_object: ObservedObject,
}

/// Last object whose interception was bypassed
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastBypassedObjectState {
    /// When the request was bypassed
    pub last_bypassed: DateTime<Utc>,
    /// Who issued it
    pub last_user_info: ObservedUser,
    /// What it was about
    pub last_bypassed_object: ObservedObject,
}

/// Commit produced on one RemoteTarget
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PushedTarget {
    /// Repository URL the commit was pushed to
    pub repository: String,
    /// Branch the commit was pushed to
    pub branch: String,
    /// Path of the file in the repository
    pub path: String,
    /// Hash of the pushed commit
    pub commit_hash: String,
}

/// Last object pushed to Git
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastPushedObjectState {
    /// When the push completed
    pub last_pushed: DateTime<Utc>,
    /// What was pushed
    pub last_pushed_object: ObservedObject,
    /// Git user that authored the commits
    pub last_pushed_git_user: String,
    /// Commits per target
    #[serde(default)]
    pub last_pushed_targets: Vec<PushedTarget>,
}

/// RemoteSyncer status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSyncerStatus {
    /// Conditions (type `Synced`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Last intercepted request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_observed_object_state: Option<LastObservedObjectState>,

    /// Last bypassed request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_bypassed_object_state: Option<LastBypassedObjectState>,

    /// Last successful push
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pushed_object_state: Option<LastPushedObjectState>,
}

impl RemoteSyncer {
    /// Mode requested by the user-specific annotation, if any
    ///
    /// An empty annotation value counts as absent.
    pub fn user_specific_mode(&self) -> crate::Result<Option<UserSpecificMode>> {
        match self.annotations().get(ANNOTATION_USER_SPECIFIC) {
            Some(value) if !value.trim().is_empty() => value.parse().map(Some),
            _ => Ok(None),
        }
    }

    /// Branches listed by the one-or-many-branches annotation, in order and deduplicated
    pub fn pattern_branches(&self) -> Vec<String> {
        let mut branches: Vec<String> = Vec::new();
        if let Some(value) = self.annotations().get(ANNOTATION_ONE_OR_MANY_BRANCHES) {
            for branch in value.split(',').map(str::trim).filter(|b| !b.is_empty()) {
                if !branches.iter().any(|b| b == branch) {
                    branches.push(branch.to_string());
                }
            }
        }
        branches
    }

    /// Denial message used by the CommitOnly strategy
    pub fn block_applied_message(&self) -> String {
        self.spec
            .default_block_applied_message
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| {
                "The changes have been pushed to the remote repository but were not applied to the cluster"
                    .to_string()
            })
    }
}
