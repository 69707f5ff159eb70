//! Error types for syngit
//!
//! The taxonomy is closed: every failure the admission path can report maps to
//! exactly one variant. Each variant renders with its kind name first
//! (`MultipleTargetError: ...`) so that admission messages and `Synced=False`
//! conditions can be matched on a stable substring.

use std::fmt;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Why a RemoteUser lookup for a host failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchFailure {
    /// No candidate matched
    NotFound,
    /// More than one candidate matched
    MoreThanOne,
}

impl fmt::Display for SearchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchFailure::NotFound => write!(f, "NotFound"),
            SearchFailure::MoreThanOne => write!(f, "MoreThanOne"),
        }
    }
}

/// Why credential resolution from a Secret failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialFailure {
    /// The referenced Secret does not exist
    SecretNotFound,
    /// More than one Secret could be used
    MoreThanOne,
    /// The Secret has no `password` entry
    TokenNotFound,
    /// The Secret is not of type `kubernetes.io/basic-auth`
    WrongSecretType,
}

impl fmt::Display for CredentialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialFailure::SecretNotFound => write!(f, "SecretNotFound"),
            CredentialFailure::MoreThanOne => write!(f, "MoreThanOne"),
            CredentialFailure::TokenNotFound => write!(f, "TokenNotFound"),
            CredentialFailure::WrongSecretType => write!(f, "WrongSecretType"),
        }
    }
}

/// Main error type for syngit operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The AdmissionReview carried no request
    #[error("EmptyRequestError: the admission review has no request")]
    EmptyRequest,

    /// The repository URL of a RemoteSyncer could not be parsed
    #[error("GitUrlParseError: {url}: {message}")]
    GitUrlParse {
        /// The offending URL
        url: String,
        /// Why it failed to parse
        message: String,
    },

    /// No RemoteUserBinding exists for the user and the syncer blocks unknown users
    #[error("RemoteUserBindingNotFoundError: no RemoteUserBinding found for the user {user}")]
    RemoteUserBindingNotFound {
        /// Requesting user
        user: String,
    },

    /// More than one RemoteUserBinding claims the same subject
    #[error("MultipleRemoteUserBindingError: {count} RemoteUserBindings found for the user {user}, only one is allowed")]
    MultipleRemoteUserBinding {
        /// Requesting user
        user: String,
        /// Number of bindings found
        count: usize,
    },

    /// The bound RemoteUsers do not resolve to exactly one identity for the host
    #[error("RemoteUserSearchError({reason}): expected exactly one RemoteUser for the host {host} bound to the user {user}")]
    RemoteUserSearch {
        /// Requesting user
        user: String,
        /// Git host derived from the syncer repository
        host: String,
        /// NotFound or MoreThanOne
        reason: SearchFailure,
    },

    /// Credentials could not be read from the RemoteUser's Secret
    #[error("CredentialSearchError({reason}): secret {secret}")]
    CredentialSearch {
        /// Secret name
        secret: String,
        /// Failure kind
        reason: CredentialFailure,
    },

    /// The default RemoteUser referenced by the syncer does not exist
    #[error("DefaultRemoteUserNotFoundError: the default RemoteUser {name} was not found")]
    DefaultRemoteUserNotFound {
        /// RemoteUser name
        name: String,
    },

    /// The default RemoteTarget referenced by the syncer does not exist
    #[error("DefaultRemoteTargetNotFoundError: the default RemoteTarget {name} was not found")]
    DefaultRemoteTargetNotFound {
        /// RemoteTarget name
        name: String,
    },

    /// The default RemoteUser does not serve the syncer's Git host
    #[error("DefaultRemoteTargetMismatchError: {message}")]
    DefaultRemoteTargetMismatch {
        /// Description of the mismatch
        message: String,
    },

    /// No RemoteTarget satisfies the binding and upstream filters
    #[error("RemoteTargetNotFoundError: {message}")]
    RemoteTargetNotFound {
        /// Description of the search
        message: String,
    },

    /// More than one RemoteTarget resolved under the OneTarget strategy
    #[error("MultipleTargetError: {count} RemoteTargets found while the target strategy is OneTarget")]
    MultipleTarget {
        /// Number of targets found
        count: usize,
    },

    /// A RemoteTarget does not point at the syncer's upstream
    #[error("RemoteTargetSearchError: {message}")]
    RemoteTargetSearch {
        /// Description of the disagreement
        message: String,
    },

    /// A label selector could not be converted to its string form
    #[error("LabelSelectorParsingError: {message}")]
    LabelSelectorParsing {
        /// Description of the problem
        message: String,
    },

    /// An excluded-fields document is malformed
    #[error("WrongYamlFormatError: {message}")]
    WrongYamlFormat {
        /// Description of the problem
        message: String,
    },

    /// The CA bundle secret has the wrong type
    #[error("CaSecretWrongTypeError: the secret {secret} is of type {found}, expected kubernetes.io/tls")]
    CaSecretWrongType {
        /// Secret name
        secret: String,
        /// Type found on the secret
        found: String,
    },

    /// The requesting user may not act on some of the scoped resources
    #[error("ResourceScopeForbiddenError: the user {user} is not allowed to {resources}")]
    ResourceScopeForbidden {
        /// Requesting user
        user: String,
        /// Comma separated `verb group/version/resource` entries that were denied
        resources: String,
    },

    /// The requesting user may not read the referenced Secret
    #[error("DenyGetSecretError: the user {user} is not allowed to get the secret {secret}")]
    DenyGetSecret {
        /// Requesting user
        user: String,
        /// Secret name
        secret: String,
    },

    /// The requesting user may not read a referenced RemoteUser
    #[error("DenyGetRemoteUserError: the user {user} is not allowed to get the remoteuser {name}")]
    DenyGetRemoteUser {
        /// Requesting user
        user: String,
        /// RemoteUser name
        name: String,
    },

    /// A RemoteTarget pointing at its own upstream declares a merge strategy
    #[error("SameUpstreamDifferentMergeStrategyError: the upstream and target are the same, the merge strategy must be empty")]
    SameUpstreamDifferentMergeStrategy,

    /// A RemoteTarget pointing elsewhere has no merge strategy
    #[error("DifferentUpstreamEmptyMergeStrategyError: the upstream and target differ, a merge strategy must be set")]
    DifferentUpstreamEmptyMergeStrategy,

    /// A bypass subject appears more than once
    #[error("NonUniqueUserError: the bypass subject {name} is declared more than once")]
    NonUniqueUser {
        /// Subject name
        name: String,
    },

    /// A Git operation failed
    #[error("GitError: {operation} {url} ({reference}) as {user}: {message}")]
    Git {
        /// Operation that failed (clone, fetch, push, ...)
        operation: String,
        /// Remote URL
        url: String,
        /// Reference being operated on
        reference: String,
        /// Git user performing the operation
        user: String,
        /// Error message followed by captured progress output
        message: String,
    },

    /// A referenced object does not exist
    #[error("NotFoundError: {kind} {name} not found")]
    NotFound {
        /// Object kind
        kind: String,
        /// Object name
        name: String,
    },

    /// Shape validation error for a syngit custom resource
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a malformed-YAML error with the given message
    pub fn wrong_yaml(msg: impl Into<String>) -> Self {
        Self::WrongYamlFormat {
            message: msg.into(),
        }
    }

    /// Create a not-found error for an object of `kind`
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether the error is an optimistic-concurrency conflict from the API server
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Whether the error is a 404 from the API server
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// Whether this error is caused by the request or the policy rather than the system
    ///
    /// Policy errors surface as 4xx admission results, everything else as 5xx.
    pub fn is_policy(&self) -> bool {
        !matches!(
            self,
            Error::Kube { .. }
                | Error::Git { .. }
                | Error::Serialization { .. }
                | Error::Internal { .. }
        )
    }

    /// Machine-readable reason used in conditions and admission statuses
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube { .. } => "KubernetesError",
            Error::EmptyRequest => "EmptyRequestError",
            Error::GitUrlParse { .. } => "GitUrlParseError",
            Error::RemoteUserBindingNotFound { .. } => "RemoteUserBindingNotFoundError",
            Error::MultipleRemoteUserBinding { .. } => "MultipleRemoteUserBindingError",
            Error::RemoteUserSearch { .. } => "RemoteUserSearchError",
            Error::CredentialSearch { .. } => "CredentialSearchError",
            Error::DefaultRemoteUserNotFound { .. } => "DefaultRemoteUserNotFoundError",
            Error::DefaultRemoteTargetNotFound { .. } => "DefaultRemoteTargetNotFoundError",
            Error::DefaultRemoteTargetMismatch { .. } => "DefaultRemoteTargetMismatchError",
            Error::RemoteTargetNotFound { .. } => "RemoteTargetNotFoundError",
            Error::MultipleTarget { .. } => "MultipleTargetError",
            Error::RemoteTargetSearch { .. } => "RemoteTargetSearchError",
            Error::LabelSelectorParsing { .. } => "LabelSelectorParsingError",
            Error::WrongYamlFormat { .. } => "WrongYamlFormatError",
            Error::CaSecretWrongType { .. } => "CaSecretWrongTypeError",
            Error::ResourceScopeForbidden { .. } => "ResourceScopeForbiddenError",
            Error::DenyGetSecret { .. } => "DenyGetSecretError",
            Error::DenyGetRemoteUser { .. } => "DenyGetRemoteUserError",
            Error::SameUpstreamDifferentMergeStrategy => "SameUpstreamDifferentMergeStrategyError",
            Error::DifferentUpstreamEmptyMergeStrategy => {
                "DifferentUpstreamEmptyMergeStrategyError"
            }
            Error::NonUniqueUser { .. } => "NonUniqueUserError",
            Error::Git { .. } => "GitError",
            Error::NotFound { .. } => "NotFoundError",
            Error::Validation { .. } => "ValidationError",
            Error::Serialization { .. } => "SerializationError",
            Error::Internal { .. } => "InternalError",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
