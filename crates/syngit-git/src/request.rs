//! Inputs and outputs of a push

use std::fmt;

use syngit_common::crd::MergeStrategy;

/// Object being written, addressed by its group/version/resource
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceRef {
    /// API group, empty for the core group
    pub group: String,
    /// API version
    pub version: String,
    /// Plural resource name (`configmaps`)
    pub resource: String,
    /// Object name
    pub name: String,
    /// Object namespace, absent for cluster-scoped objects
    pub namespace: Option<String>,
}

impl ResourceRef {
    /// `apiVersion` as written in manifests
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// Commit author and push credentials
#[derive(Clone, Default)]
pub struct Author {
    /// Git user name (also the basic-auth user)
    pub username: String,
    /// Commit email
    pub email: String,
    /// Basic-auth password or token
    pub token: String,
}

impl fmt::Debug for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Author")
            .field("username", &self.username)
            .field("email", &self.email)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Server certificate handling
#[derive(Clone, Debug, Default)]
pub struct TlsSettings {
    /// Accept any certificate
    pub insecure_skip_verify: bool,
    /// PEM bundle of CAs trusted in addition to the system store
    pub ca_bundle: Option<Vec<u8>>,
}

/// Everything needed to materialize one object on one target
#[derive(Clone, Debug, Default)]
pub struct PushRequest {
    /// Repository the target derives from
    pub upstream_repository: String,
    /// Branch the target derives from
    pub upstream_branch: String,
    /// Repository receiving the push
    pub target_repository: String,
    /// Branch receiving the push
    pub target_branch: String,
    /// Alignment with the upstream; `None` when upstream and target are the same
    pub merge_strategy: Option<MergeStrategy>,
    /// Directory prefix inside the repository
    pub root_path: Option<String>,
    /// Object being written
    pub resource: ResourceRef,
    /// Rendered manifest; empty for a deletion
    pub yaml: String,
    /// Commit author and credentials
    pub author: Author,
    /// Certificate handling
    pub tls: TlsSettings,
    /// Look for an existing document describing the object before using the constructed path
    pub resource_finder: bool,
}

impl PushRequest {
    /// Whether the request deletes the object
    pub fn is_deletion(&self) -> bool {
        self.yaml.is_empty()
    }

    /// Whether the push must be forced
    pub fn force_push(&self) -> bool {
        self.merge_strategy.is_some_and(|s| s.forces_push())
    }

    /// Commit message for this request
    pub fn commit_message(&self) -> String {
        let verb = if self.is_deletion() {
            "Delete"
        } else {
            "Add or modify"
        };
        format!("{} {} {}", verb, self.resource.resource, self.resource.name)
    }
}

/// Result of a push on one target
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// Repository pushed to
    pub repository: String,
    /// Branch pushed to
    pub branch: String,
    /// Path of the file inside the repository
    pub path: String,
    /// Head of the branch after the push; empty when the branch does not exist
    pub commit_hash: String,
    /// Whether a new commit was created
    pub committed: bool,
}
