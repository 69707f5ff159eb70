//! Types shared by several syngit custom resources

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to an object by name in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    /// Name of the referenced object
    pub name: String,
}

impl ObjectRef {
    /// Reference the object called `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Reference to an object by name, optionally in another namespace
///
/// Cross-namespace references are rejected by the validators; the field exists
/// so that the rejection can be explicit instead of silently ignored.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct NamespacedObjectRef {
    /// Name of the referenced object
    pub name: String,
    /// Namespace of the referenced object (defaults to the referrer's)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// RBAC-style subject identifying a cluster user
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Subject {
    /// Kind of subject: `User` or `ServiceAccount`
    pub kind: String,
    /// Name of the subject
    pub name: String,
    /// Namespace of a ServiceAccount subject
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Subject {
    /// Kind value for user subjects
    pub const USER: &'static str = "User";
    /// Kind value for service account subjects
    pub const SERVICE_ACCOUNT: &'static str = "ServiceAccount";

    /// Create a `User` subject
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            kind: Self::USER.to_string(),
            name: name.into(),
            namespace: None,
        }
    }

    /// Whether this subject designates the user name carried by an admission request
    pub fn matches_username(&self, username: &str) -> bool {
        match self.kind.as_str() {
            Self::SERVICE_ACCOUNT => {
                let namespace = self.namespace.as_deref().unwrap_or_default();
                username == format!("system:serviceaccount:{}:{}", namespace, self.name)
            }
            _ => self.name == username,
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Synced)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Insert or replace the condition with the same type
///
/// The transition time is kept when the status does not change.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            let transition = if existing.status == condition.status {
                existing.last_transition_time
            } else {
                condition.last_transition_time
            };
            *existing = condition;
            existing.last_transition_time = transition;
        }
        None => conditions.push(condition),
    }
}
