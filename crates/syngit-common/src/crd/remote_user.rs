//! RemoteUser CRD: one Git identity on one host

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ObjectRef;
use crate::ANNOTATION_ASSOCIATED_BINDING;

/// RemoteUser binds a Git host to credentials stored in a basic-auth Secret
///
/// Example:
/// ```yaml
/// apiVersion: syngit.io/v1beta3
/// kind: RemoteUser
/// metadata:
///   name: luffy-github
///   namespace: test
///   annotations:
///     syngit.io/associated-remote-userbinding: "true"
/// spec:
///   email: luffy@example.com
///   gitBaseDomainFQDN: github.com
///   secretRef:
///     name: luffy-creds
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "syngit.io",
    version = "v1beta3",
    kind = "RemoteUser",
    namespaced,
    shortname = "ru",
    printcolumn = r#"{"name":"Host","type":"string","jsonPath":".spec.gitBaseDomainFQDN"}"#,
    printcolumn = r#"{"name":"Email","type":"string","jsonPath":".spec.email"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUserSpec {
    /// Email used as the commit author
    pub email: String,

    /// Git host this identity is valid for
    #[serde(rename = "gitBaseDomainFQDN")]
    pub git_base_domain_fqdn: String,

    /// Secret of type `kubernetes.io/basic-auth` in the same namespace
    pub secret_ref: ObjectRef,
}

impl RemoteUser {
    /// Whether the user asked for automatic association with a RemoteUserBinding
    pub fn wants_association(&self) -> bool {
        annotation_is_true(self.annotations().get(ANNOTATION_ASSOCIATED_BINDING))
    }
}

/// Whether an annotation value is the string `true` (case-insensitive)
pub fn annotation_is_true(value: Option<&String>) -> bool {
    value
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
