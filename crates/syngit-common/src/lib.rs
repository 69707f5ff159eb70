//! Common types for syngit: CRDs, errors, rendering and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod git_url;
pub mod kube_utils;
pub mod render;
pub mod retry;
pub mod telemetry;
pub mod yaml;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of every syngit custom resource
pub const API_GROUP: &str = "syngit.io";

/// Served and stored version of the syngit custom resources
pub const API_VERSION: &str = "v1beta3";

/// Default namespace of the controller when `MANAGER_NAMESPACE` is not set
pub const DEFAULT_MANAGER_NAMESPACE: &str = "syngit";

/// Field manager used for every write issued by the controller
pub const FIELD_MANAGER: &str = "syngit-controller";

// =============================================================================
// Labels
// =============================================================================

/// Label key marking a resource as created by a pattern
pub const LABEL_MANAGED_BY: &str = "managed-by";

/// Value of [`LABEL_MANAGED_BY`] for syngit-owned resources
pub const MANAGED_BY_SYNGIT: &str = "syngit.io";

/// Label key carrying the (sanitized) Kubernetes user a managed resource belongs to
pub const LABEL_K8S_USER: &str = "syngit.io/k8s-user";

/// Label key naming the pattern that created a RemoteTarget
pub const LABEL_PATTERN: &str = "syngit.io/remotetarget.pattern";

/// Label key carrying the target branch of a pattern-managed RemoteTarget
pub const LABEL_BRANCH: &str = "syngit.io/remotetarget.branch";

/// Label key allowing a pattern-managed RemoteTarget to be bound by several subjects
pub const LABEL_ALLOW_INJECTION: &str = "syngit.io/remotetarget.allow-injection";

/// Label selecting the cluster-wide default excluded-fields ConfigMaps
pub const LABEL_CLUSTER_DEFAULT_EXCLUDED_FIELDS: &str = "syngit.io/cluster-default-excluded-fields";

// =============================================================================
// Annotations
// =============================================================================

/// RemoteSyncer annotation activating the user-specific pattern
pub const ANNOTATION_USER_SPECIFIC: &str = "syngit.io/remotetarget.pattern.user-specific";

/// RemoteSyncer annotation activating the one-or-many-branches pattern
pub const ANNOTATION_ONE_OR_MANY_BRANCHES: &str = "syngit.io/remotetarget.pattern.one-or-many-branches";

/// RemoteUser annotation requesting association with a managed RemoteUserBinding
pub const ANNOTATION_ASSOCIATED_BINDING: &str = "syngit.io/associated-remote-userbinding";

/// Pattern label value for targets created by the one-or-many-branches pattern
pub const PATTERN_ONE_OR_MANY_BRANCHES: &str = "one-or-many-branches";

/// Pattern label value for targets created by the one-user-one-branch pattern
pub const PATTERN_ONE_USER_ONE_BRANCH: &str = "user-specific.one-user-one-branch";

/// Pattern label value for targets created by the one-user-one-fork pattern
pub const PATTERN_ONE_USER_ONE_FORK: &str = "user-specific.one-user-one-fork";

/// ConfigMap data key holding a YAML list of excluded field paths
pub const EXCLUDED_FIELDS_KEY: &str = "excludedFields";
