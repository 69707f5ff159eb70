//! RemoteUserBinding webhooks

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::ResourceExt;
use tracing::debug;

use syngit_common::crd::{RemoteUserBinding, Subject};
use syngit_common::kube_utils::sanitize_label_value;
use syngit_common::{
    Error, Result, API_GROUP, API_VERSION, LABEL_K8S_USER, PATTERN_ONE_USER_ONE_BRANCH,
    PATTERN_ONE_USER_ONE_FORK,
};

use super::{previous, respond, review_for, submitted, username};
use crate::cluster::ClusterClient;
use crate::context::Context;
use crate::pattern::remote_user_association::managed_binding_selector;

/// `/validate-syngit-io-v1beta3-remoteuserbinding`
pub async fn validate(ctx: &Context, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    respond(request, check(ctx.cluster.as_ref(), request).await)
}

async fn check(cluster: &dyn ClusterClient, request: &AdmissionRequest<DynamicObject>) -> Result<()> {
    let Some(binding) = submitted::<RemoteUserBinding>(request)? else {
        return Ok(());
    };
    let subject = &binding.spec.subject;
    if subject.name.trim().is_empty() {
        return Err(Error::validation("spec.subject.name must not be empty"));
    }
    if subject.kind != Subject::USER && subject.kind != Subject::SERVICE_ACCOUNT {
        return Err(Error::validation(format!(
            "spec.subject.kind {:?} must be User or ServiceAccount",
            subject.kind
        )));
    }
    if let Some(stored) = previous::<RemoteUserBinding>(request)? {
        if stored.spec.subject != *subject {
            return Err(Error::validation("spec.subject is immutable"));
        }
    }

    let namespace = binding.namespace().unwrap_or_default();
    check_remote_users(cluster, &namespace, &binding).await?;
    check_targets(cluster, &namespace, &binding).await?;
    if binding.is_managed() {
        check_unique_managed(cluster, &namespace, &binding).await?;
    }
    Ok(())
}

/// At most one referenced RemoteUser per Git host
async fn check_remote_users(
    cluster: &dyn ClusterClient,
    namespace: &str,
    binding: &RemoteUserBinding,
) -> Result<()> {
    let mut hosts: BTreeMap<String, String> = BTreeMap::new();
    for reference in &binding.spec.remote_user_refs {
        let Some(remote_user) = cluster.get_remote_user(namespace, &reference.name).await? else {
            continue;
        };
        let host = remote_user.spec.git_base_domain_fqdn.trim().to_ascii_lowercase();
        if let Some(other) = hosts.insert(host.clone(), reference.name.clone()) {
            return Err(Error::validation(format!(
                "spec.remoteUserRefs: {} and {} both serve the host {}, only one RemoteUser per host is allowed",
                other, reference.name, host
            )));
        }
    }
    Ok(())
}

/// Referenced RemoteTargets exist, and user-specific ones belong to the subject
async fn check_targets(
    cluster: &dyn ClusterClient,
    namespace: &str,
    binding: &RemoteUserBinding,
) -> Result<()> {
    let owner = sanitize_label_value(&binding.spec.subject.name);
    for reference in &binding.spec.remote_target_refs {
        let target = cluster
            .get_remote_target(namespace, &reference.name)
            .await?
            .ok_or_else(|| Error::not_found("RemoteTarget", &reference.name))?;
        let user_specific = matches!(
            target.pattern(),
            Some(PATTERN_ONE_USER_ONE_BRANCH | PATTERN_ONE_USER_ONE_FORK)
        );
        if !user_specific || target.allows_injection() {
            continue;
        }
        if target.labels().get(LABEL_K8S_USER) != Some(&owner) {
            return Err(Error::validation(format!(
                "spec.remoteTargetRefs: the RemoteTarget {} belongs to another user and is not open to injection",
                reference.name
            )));
        }
    }
    Ok(())
}

/// One managed binding per subject
///
/// Bindings of other subjects may carry the same `k8s-user` label value.
async fn check_unique_managed(
    cluster: &dyn ClusterClient,
    namespace: &str,
    binding: &RemoteUserBinding,
) -> Result<()> {
    let name = binding.name_any();
    let others = cluster
        .list_remote_user_bindings(namespace, &managed_binding_selector(&binding.spec.subject.name))
        .await?
        .into_iter()
        .filter(|b| b.name_any() != name && b.spec.subject == binding.spec.subject)
        .count();
    if others > 0 {
        return Err(Error::MultipleRemoteUserBinding {
            user: binding.spec.subject.name.clone(),
            count: others + 1,
        });
    }
    Ok(())
}

/// `/syngit-v1beta3-remoteuserbinding-permissions`
pub async fn permissions(ctx: &Context, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    respond(request, check_remote_user_access(ctx.cluster.as_ref(), request).await)
}

async fn check_remote_user_access(
    cluster: &dyn ClusterClient,
    request: &AdmissionRequest<DynamicObject>,
) -> Result<()> {
    let Some(binding) = submitted::<RemoteUserBinding>(request)? else {
        return Ok(());
    };
    for reference in &binding.spec.remote_user_refs {
        let review = review_for(
            request,
            binding.namespace(),
            "get",
            (API_GROUP, API_VERSION, "remoteusers"),
            Some(reference.name.clone()),
        );
        let decision = cluster.review_access(&review).await?;
        if !decision.allowed {
            debug!(remote_user = %reference.name, reason = %decision.reason, "remoteuser access denied");
            return Err(Error::DenyGetRemoteUser {
                user: username(request),
                name: reference.name.clone(),
            });
        }
    }
    Ok(())
}
