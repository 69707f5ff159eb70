//! RemoteUserBinding CRD: subject to identities and targets

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ObjectRef, Subject};
use crate::{LABEL_K8S_USER, LABEL_MANAGED_BY, MANAGED_BY_SYNGIT};

/// RemoteUserBinding associates a cluster subject with its RemoteUsers and RemoteTargets
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "syngit.io",
    version = "v1beta3",
    kind = "RemoteUserBinding",
    namespaced,
    shortname = "rub",
    printcolumn = r#"{"name":"Subject","type":"string","jsonPath":".spec.subject.name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUserBindingSpec {
    /// Cluster subject owning the binding
    pub subject: Subject,

    /// RemoteUsers usable by the subject, at most one per Git host
    #[serde(default)]
    pub remote_user_refs: Vec<ObjectRef>,

    /// RemoteTargets the subject may push to
    #[serde(default)]
    pub remote_target_refs: Vec<ObjectRef>,
}

impl RemoteUserBinding {
    /// Whether the binding was created by the association pattern
    pub fn is_managed(&self) -> bool {
        self.labels().get(LABEL_MANAGED_BY).map(String::as_str) == Some(MANAGED_BY_SYNGIT)
    }

    /// Whether the binding is managed on behalf of `username`
    ///
    /// The `k8s-user` label is a lossy encoding of the user name, so the
    /// subject decides.
    pub fn is_managed_for(&self, username: &str) -> bool {
        self.is_managed()
            && self.labels().get(LABEL_K8S_USER).map(String::as_str)
                == Some(crate::kube_utils::sanitize_label_value(username).as_str())
            && self.spec.subject.matches_username(username)
    }

    /// Whether `name` is among the referenced RemoteTargets
    pub fn references_target(&self, name: &str) -> bool {
        self.spec.remote_target_refs.iter().any(|r| r.name == name)
    }

    /// Whether `name` is among the referenced RemoteUsers
    pub fn references_user(&self, name: &str) -> bool {
        self.spec.remote_user_refs.iter().any(|r| r.name == name)
    }

    /// Append a RemoteTarget reference unless present; returns whether it changed
    pub fn link_target(&mut self, name: &str) -> bool {
        if self.references_target(name) {
            return false;
        }
        self.spec.remote_target_refs.push(ObjectRef::new(name));
        true
    }

    /// Remove a RemoteTarget reference; returns whether it changed
    pub fn unlink_target(&mut self, name: &str) -> bool {
        let before = self.spec.remote_target_refs.len();
        self.spec.remote_target_refs.retain(|r| r.name != name);
        before != self.spec.remote_target_refs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding() -> RemoteUserBinding {
        RemoteUserBinding::new(
            "associated-rub-luffy",
            RemoteUserBindingSpec {
                subject: Subject::user("luffy"),
                remote_user_refs: vec![ObjectRef::new("luffy-github")],
                remote_target_refs: vec![],
            },
        )
    }

    #[test]
    fn link_and_unlink_are_idempotent() {
        let mut rub = binding();
        assert!(rub.link_target("rt-a"));
        assert!(!rub.link_target("rt-a"));
        assert!(rub.references_target("rt-a"));
        assert!(rub.unlink_target("rt-a"));
        assert!(!rub.unlink_target("rt-a"));
        assert!(rub.spec.remote_target_refs.is_empty());
    }

    #[test]
    fn managed_labels_are_recognised() {
        let mut rub = binding();
        assert!(!rub.is_managed());
        rub.labels_mut()
            .insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_SYNGIT.to_string());
        rub.labels_mut()
            .insert(LABEL_K8S_USER.to_string(), "luffy".to_string());
        assert!(rub.is_managed());
        assert!(rub.is_managed_for("luffy"));
        assert!(!rub.is_managed_for("zoro"));
        assert!(rub.references_user("luffy-github"));
    }

    #[test]
    fn colliding_user_labels_do_not_share_a_binding() {
        let mut rub = binding();
        rub.spec.subject = Subject::user("luffy@example.com");
        rub.labels_mut()
            .insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_SYNGIT.to_string());
        rub.labels_mut().insert(
            LABEL_K8S_USER.to_string(),
            crate::kube_utils::sanitize_label_value("luffy@example.com"),
        );
        assert_eq!(
            crate::kube_utils::sanitize_label_value("luffy@example.com"),
            crate::kube_utils::sanitize_label_value("luffy_example.com")
        );
        assert!(rub.is_managed_for("luffy@example.com"));
        assert!(!rub.is_managed_for("luffy_example.com"));
    }
}
