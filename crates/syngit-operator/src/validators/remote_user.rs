//! RemoteUser webhooks

use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::ResourceExt;
use tracing::debug;

use syngit_common::crd::RemoteUser;
use syngit_common::error::CredentialFailure;
use syngit_common::git_url::GitUrl;
use syngit_common::{Error, Result};

use super::{previous, respond, respond_pattern, review_for, submitted, username};
use crate::admission::identity::{serves_host, BASIC_AUTH_SECRET_TYPE};
use crate::cluster::ClusterClient;
use crate::context::Context;
use crate::pattern::remote_user_association::managed_bindings;
use crate::pattern::{trigger, PatternError, RemoteUserAssociationPattern, UserSpecificPattern};

/// Shape checks of a RemoteUser
pub fn validate_spec(remote_user: &RemoteUser) -> Result<()> {
    let spec = &remote_user.spec;
    let email_ok = spec
        .email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty() && !domain.contains('@'));
    if !email_ok {
        return Err(Error::validation(format!(
            "spec.email {:?} is not an email address",
            spec.email
        )));
    }

    let fqdn = spec.git_base_domain_fqdn.trim();
    if fqdn.is_empty() || fqdn.contains("://") || fqdn.contains('/') {
        return Err(Error::validation(format!(
            "spec.gitBaseDomainFQDN {:?} must be a bare host name, optionally with a port",
            spec.git_base_domain_fqdn
        )));
    }

    if spec.secret_ref.name.trim().is_empty() {
        return Err(Error::validation("spec.secretRef.name must not be empty"));
    }
    Ok(())
}

/// `/validate-syngit-io-v1beta3-remoteuser`
///
/// A Secret that does not exist yet is accepted; an existing one must be of
/// the basic-auth type.
pub async fn validate(ctx: &Context, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    respond(request, check(ctx.cluster.as_ref(), request).await)
}

async fn check(cluster: &dyn ClusterClient, request: &AdmissionRequest<DynamicObject>) -> Result<()> {
    let Some(remote_user) = submitted::<RemoteUser>(request)? else {
        return Ok(());
    };
    validate_spec(&remote_user)?;

    let namespace = remote_user.namespace().unwrap_or_default();
    let secret_name = &remote_user.spec.secret_ref.name;
    if let Some(secret) = cluster.get_secret(&namespace, secret_name).await? {
        if secret.type_.as_deref() != Some(BASIC_AUTH_SECRET_TYPE) {
            return Err(Error::CredentialSearch {
                secret: secret_name.clone(),
                reason: CredentialFailure::WrongSecretType,
            });
        }
    }
    Ok(())
}

/// `/syngit-v1beta3-remoteuser-permissions`
pub async fn permissions(ctx: &Context, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    respond(request, check_secret_access(ctx.cluster.as_ref(), request).await)
}

async fn check_secret_access(
    cluster: &dyn ClusterClient,
    request: &AdmissionRequest<DynamicObject>,
) -> Result<()> {
    let Some(remote_user) = submitted::<RemoteUser>(request)? else {
        return Ok(());
    };
    let secret = remote_user.spec.secret_ref.name.clone();
    let review = review_for(
        request,
        remote_user.namespace(),
        "get",
        ("", "v1", "secrets"),
        Some(secret.clone()),
    );
    let decision = cluster.review_access(&review).await?;
    if decision.allowed {
        return Ok(());
    }
    debug!(secret = %secret, reason = %decision.reason, "secret access denied");
    Err(Error::DenyGetSecret {
        user: username(request),
        secret,
    })
}

/// `/syngit-v1beta3-remoteuser-association`
///
/// Associates or dissociates the RemoteUser with the requester's managed
/// binding, then brings the requester's user-specific targets in line with
/// the RemoteSyncers of the RemoteUser's host.
pub async fn association(ctx: &Context, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    respond_pattern(request, run_association(ctx.cluster.as_ref(), request).await)
}

async fn run_association(
    cluster: &dyn ClusterClient,
    request: &AdmissionRequest<DynamicObject>,
) -> std::result::Result<(), PatternError> {
    let current = submitted::<RemoteUser>(request)?;
    let stored = previous::<RemoteUser>(request)?;
    let Some(remote_user) = current.as_ref().or(stored.as_ref()) else {
        return Ok(());
    };
    let namespace = remote_user.namespace().unwrap_or_default();
    let name = remote_user.name_any();
    let user = username(request);

    let associate = current.as_ref().is_some_and(RemoteUser::wants_association);
    let was_associated = stored.as_ref().is_some_and(RemoteUser::wants_association);
    if associate || was_associated {
        let mut pattern =
            RemoteUserAssociationPattern::new(cluster, &namespace, &user, &name, associate);
        trigger(&mut pattern).await?;
    }

    let Some(remote_user) = current.as_ref() else {
        return Ok(());
    };
    let mut bindings = managed_bindings(cluster, &namespace, &user).await?;
    let Some(mut binding) = bindings.pop() else {
        return Ok(());
    };

    for syncer in cluster.list_remote_syncers(&namespace).await? {
        if !matches!(syncer.user_specific_mode(), Ok(Some(_))) {
            continue;
        }
        let served = GitUrl::parse(&syncer.spec.remote_repository)
            .is_ok_and(|url| serves_host(remote_user, &url));
        if !served {
            continue;
        }
        let mut pattern = UserSpecificPattern::new(cluster, &syncer, user.clone(), binding);
        trigger(&mut pattern).await?;
        binding = pattern.into_binding();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::fixtures::request;
    use crate::admission::pusher::MockGitPusher;
    use crate::testing::{basic_auth, remote_user, syncer, FakeCluster};
    use serde_json::Value;
    use std::sync::Arc;
    use syngit_common::{ANNOTATION_ASSOCIATED_BINDING, ANNOTATION_USER_SPECIFIC};

    const RU: (&str, &str, &str) = ("syngit.io", "v1beta3", "remoteusers");

    fn json(ru: &RemoteUser) -> Value {
        serde_json::to_value(ru).unwrap()
    }

    fn context(cluster: Arc<FakeCluster>) -> Context {
        Context::for_testing(cluster, Arc::new(MockGitPusher::new()))
    }

    fn associated(name: &str, host: &str) -> RemoteUser {
        let mut ru = remote_user(name, host);
        ru.annotations_mut()
            .insert(ANNOTATION_ASSOCIATED_BINDING.to_string(), "true".to_string());
        ru
    }

    #[test]
    fn shape_rules() {
        let mut ru = remote_user("luffy-ru", "git.example.com");
        assert!(validate_spec(&ru).is_ok());
        ru.spec.git_base_domain_fqdn = "git.example.com:8443".to_string();
        assert!(validate_spec(&ru).is_ok());
        ru.spec.git_base_domain_fqdn = "https://git.example.com".to_string();
        assert!(validate_spec(&ru).is_err());

        ru = remote_user("luffy-ru", "git.example.com");
        ru.spec.email = "luffy".to_string();
        assert!(validate_spec(&ru).is_err());
    }

    #[tokio::test]
    async fn existing_secrets_must_be_basic_auth() {
        let cluster = Arc::new(FakeCluster::new());
        let ctx = context(cluster.clone());
        let ru = remote_user("luffy-ru", "git.example.com");
        let req = request("CREATE", RU, "luffy", Some(json(&ru)), None);
        assert!(validate(&ctx, &req).await.allowed);

        let mut secret = basic_auth("luffy-ru-creds", "luffy", Some("token"));
        cluster.add_secret(secret.clone());
        assert!(validate(&ctx, &req).await.allowed);

        secret.type_ = Some("Opaque".to_string());
        cluster.add_secret(secret);
        let response = validate(&ctx, &req).await;
        assert!(!response.allowed);
        assert!(response
            .result
            .message
            .contains("CredentialSearchError(WrongSecretType)"));
    }

    #[tokio::test]
    async fn reading_the_secret_must_be_allowed() {
        let cluster = Arc::new(FakeCluster::new());
        let ctx = context(cluster.clone());
        let ru = remote_user("luffy-ru", "git.example.com");
        let req = request("CREATE", RU, "luffy", Some(json(&ru)), None);
        assert!(permissions(&ctx, &req).await.allowed);

        cluster.deny_access("luffy", "get", "secrets");
        let response = permissions(&ctx, &req).await;
        assert!(!response.allowed);
        assert_eq!(response.result.code, 403);
        assert!(response.result.message.contains("DenyGetSecretError"));
        assert!(response.result.message.contains("luffy-ru-creds"));
    }

    /// Story: an associated RemoteUser gets a managed binding and the user's branch target
    #[tokio::test]
    async fn story_association_then_user_specific_target() {
        let cluster = Arc::new(FakeCluster::new());
        let mut rsy = syncer("rsy", "https://git.example.com/platform/cluster.git");
        rsy.annotations_mut()
            .insert(ANNOTATION_USER_SPECIFIC.to_string(), "one-user-one-branch".to_string());
        cluster.add_syncer(rsy);
        cluster.add_syncer(syncer("other", "https://elsewhere.example.com/a.git"));
        let ctx = context(cluster.clone());

        let ru = associated("luffy-ru", "git.example.com");
        let req = request("CREATE", RU, "luffy", Some(json(&ru)), None);
        let response = association(&ctx, &req).await;
        assert!(response.allowed, "{}", response.result.message);

        let bindings = cluster.bindings("test");
        assert_eq!(bindings.len(), 1);
        assert!(bindings[0].is_managed_for("luffy"));
        assert!(bindings[0].references_user("luffy-ru"));
        assert_eq!(bindings[0].spec.remote_target_refs.len(), 1);
        let targets = cluster.targets("test");
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].spec.target_branch, "luffy");

        let plain = remote_user("luffy-ru", "git.example.com");
        let req = request("UPDATE", RU, "luffy", Some(json(&plain)), Some(json(&ru)));
        assert!(association(&ctx, &req).await.allowed);
        assert!(cluster.bindings("test").is_empty());
    }

    #[tokio::test]
    async fn only_the_owner_dissociates_on_delete() {
        let cluster = Arc::new(FakeCluster::new());
        let ctx = context(cluster.clone());
        let ru = associated("luffy-ru", "git.example.com");
        let req = request("CREATE", RU, "luffy", Some(json(&ru)), None);
        assert!(association(&ctx, &req).await.allowed);

        let req = request("DELETE", RU, "zoro", None, Some(json(&ru)));
        let response = association(&ctx, &req).await;
        assert!(!response.allowed);
        assert_eq!(response.result.code, 403);

        let req = request("DELETE", RU, "luffy", None, Some(json(&ru)));
        assert!(association(&ctx, &req).await.allowed);
        assert!(cluster.bindings("test").is_empty());
    }
}
