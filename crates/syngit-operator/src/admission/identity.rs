//! Identity resolution: requesting user to Git credentials
//!
//! The user's RemoteUserBinding names candidate RemoteUsers; exactly one of
//! them must serve the syncer's Git host. Without a binding, the syncer may
//! fall back to its default RemoteUser.

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::{debug, warn};

use syngit_common::crd::{RemoteSyncer, RemoteUser, RemoteUserBinding, UnauthorizedUserMode};
use syngit_common::error::{CredentialFailure, SearchFailure};
use syngit_common::git_url::GitUrl;
use syngit_common::kube_utils::label_selector_to_string;
use syngit_common::{Error, Result};
use syngit_git::Author;

use crate::cluster::ClusterClient;

/// Secret type required for RemoteUser credentials
pub const BASIC_AUTH_SECRET_TYPE: &str = "kubernetes.io/basic-auth";

/// Who pushes on behalf of the requesting user
#[derive(Clone, Debug)]
pub struct ResolvedIdentity {
    /// Commit author and push credentials
    pub author: Author,
    /// RemoteUser the credentials come from
    pub remote_user: String,
    /// Binding of the requesting user; `None` on the default-user path
    pub binding: Option<RemoteUserBinding>,
}

/// Whether a RemoteUser's FQDN designates the host of a repository URL
///
/// The FQDN may carry the port when the repository URL does.
pub fn serves_host(remote_user: &RemoteUser, url: &GitUrl) -> bool {
    let fqdn = remote_user.spec.git_base_domain_fqdn.trim().to_ascii_lowercase();
    if fqdn == url.host {
        return true;
    }
    match url.port {
        Some(port) => fqdn == format!("{}:{}", url.host, port),
        None => false,
    }
}

/// Find the unique binding whose subject is `username`
pub async fn find_binding(
    cluster: &dyn ClusterClient,
    syncer: &RemoteSyncer,
    username: &str,
) -> Result<Option<RemoteUserBinding>> {
    let namespace = syncer.namespace().unwrap_or_default();
    let selector = label_selector_to_string(syncer.spec.remote_user_binding_selector.as_ref())?;
    let mut bindings: Vec<RemoteUserBinding> = cluster
        .list_remote_user_bindings(&namespace, &selector)
        .await?
        .into_iter()
        .filter(|b| b.spec.subject.matches_username(username))
        .collect();

    match bindings.len() {
        0 => Ok(None),
        1 => Ok(bindings.pop()),
        count => Err(Error::MultipleRemoteUserBinding {
            user: username.to_string(),
            count,
        }),
    }
}

/// Resolve the Git identity of `username` for the syncer's repository
pub async fn resolve_identity(
    cluster: &dyn ClusterClient,
    syncer: &RemoteSyncer,
    username: &str,
) -> Result<ResolvedIdentity> {
    let url = GitUrl::parse(&syncer.spec.remote_repository)?;
    let namespace = syncer.namespace().unwrap_or_default();

    if let Some(binding) = find_binding(cluster, syncer, username).await? {
        let remote_user = bound_remote_user(cluster, &namespace, &binding, username, &url).await?;
        let author = credentials(cluster, &namespace, &remote_user).await?;
        debug!(user = %username, remote_user = %remote_user.name_any(), "resolved identity from binding");
        return Ok(ResolvedIdentity {
            author,
            remote_user: remote_user.name_any(),
            binding: Some(binding),
        });
    }

    let default_ref = match (
        syncer.spec.default_unauthorized_user_mode,
        syncer.spec.default_remote_user_ref.as_ref(),
    ) {
        (UnauthorizedUserMode::UseDefaultUser, Some(r)) => r,
        _ => {
            return Err(Error::RemoteUserBindingNotFound {
                user: username.to_string(),
            })
        }
    };

    let remote_user = cluster
        .get_remote_user(&namespace, &default_ref.name)
        .await?
        .ok_or_else(|| Error::DefaultRemoteUserNotFound {
            name: default_ref.name.clone(),
        })?;
    if !serves_host(&remote_user, &url) {
        return Err(Error::DefaultRemoteTargetMismatch {
            message: format!(
                "the default RemoteUser {} is for {}, the repository is on {}",
                default_ref.name, remote_user.spec.git_base_domain_fqdn, url.host
            ),
        });
    }
    let author = credentials(cluster, &namespace, &remote_user).await?;
    debug!(user = %username, remote_user = %default_ref.name, "using the default RemoteUser");
    Ok(ResolvedIdentity {
        author,
        remote_user: default_ref.name.clone(),
        binding: None,
    })
}

async fn bound_remote_user(
    cluster: &dyn ClusterClient,
    namespace: &str,
    binding: &RemoteUserBinding,
    username: &str,
    url: &GitUrl,
) -> Result<RemoteUser> {
    let mut matching = Vec::new();
    for reference in &binding.spec.remote_user_refs {
        match cluster.get_remote_user(namespace, &reference.name).await? {
            Some(remote_user) if serves_host(&remote_user, url) => matching.push(remote_user),
            Some(_) => {}
            None => warn!(
                binding = %binding.name_any(),
                remote_user = %reference.name,
                "RemoteUserBinding references a missing RemoteUser"
            ),
        }
    }

    let reason = match matching.len() {
        1 => return Ok(matching.remove(0)),
        0 => SearchFailure::NotFound,
        _ => SearchFailure::MoreThanOne,
    };
    Err(Error::RemoteUserSearch {
        user: username.to_string(),
        host: url.host.clone(),
        reason,
    })
}

/// Read the basic-auth credentials of a RemoteUser
pub async fn credentials(
    cluster: &dyn ClusterClient,
    namespace: &str,
    remote_user: &RemoteUser,
) -> Result<Author> {
    let secret_name = &remote_user.spec.secret_ref.name;
    let secret = cluster
        .get_secret(namespace, secret_name)
        .await?
        .ok_or_else(|| Error::CredentialSearch {
            secret: secret_name.clone(),
            reason: CredentialFailure::SecretNotFound,
        })?;
    author_from_secret(&secret, remote_user)
}

fn author_from_secret(secret: &Secret, remote_user: &RemoteUser) -> Result<Author> {
    let secret_name = secret.name_any();
    if secret.type_.as_deref() != Some(BASIC_AUTH_SECRET_TYPE) {
        return Err(Error::CredentialSearch {
            secret: secret_name,
            reason: CredentialFailure::WrongSecretType,
        });
    }
    let field = |key: &str| {
        secret
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .map(|v| String::from_utf8_lossy(&v.0).trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let token = field("password").ok_or_else(|| Error::CredentialSearch {
        secret: secret_name.clone(),
        reason: CredentialFailure::TokenNotFound,
    })?;
    Ok(Author {
        username: field("username").unwrap_or_else(|| remote_user.name_any()),
        email: remote_user.spec.email.clone(),
        token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{basic_auth, binding, remote_user, seed_identity, syncer, FakeCluster};
    use syngit_common::crd::ObjectRef;

    const REPO: &str = "https://git.example.com/platform/cluster.git";

    #[tokio::test]
    async fn bound_user_resolves_to_its_host_identity() {
        let cluster = FakeCluster::new();
        seed_identity(&cluster, "luffy", "git.example.com", &[]);
        cluster.add_user(remote_user("luffy-gh", "github.com"));
        let mut rub = cluster.bindings("test").remove(0);
        rub.spec.remote_user_refs.push(ObjectRef::new("luffy-gh"));
        cluster.add_binding(rub);

        let identity = resolve_identity(&cluster, &syncer("rsy", REPO), "luffy")
            .await
            .unwrap();
        assert_eq!(identity.remote_user, "luffy-ru");
        assert_eq!(identity.author.username, "luffy");
        assert_eq!(identity.author.token, "token");
        assert_eq!(identity.author.email, "luffy-ru@example.com");
        assert!(identity.binding.is_some());
    }

    /// Story: S6, two bindings claim the same subject
    #[tokio::test]
    async fn story_duplicate_subject_is_fatal() {
        let cluster = FakeCluster::new();
        seed_identity(&cluster, "luffy", "git.example.com", &[]);
        cluster.add_binding(binding("luffy-rub-2", "luffy", &["luffy-ru"], &[]));

        let err = resolve_identity(&cluster, &syncer("rsy", REPO), "luffy")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("MultipleRemoteUserBindingError"));
    }

    #[tokio::test]
    async fn host_must_match_exactly_one_remote_user() {
        let cluster = FakeCluster::new();
        cluster.add_user(remote_user("a", "git.example.com"));
        cluster.add_user(remote_user("b", "git.example.com"));
        cluster.add_user(remote_user("c", "gitlab.com"));
        cluster.add_binding(binding("zoro-rub", "zoro", &["a", "b"], &[]));
        cluster.add_binding(binding("nami-rub", "nami", &["c", "missing"], &[]));

        let err = resolve_identity(&cluster, &syncer("rsy", REPO), "zoro")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("RemoteUserSearchError(MoreThanOne)"));

        let err = resolve_identity(&cluster, &syncer("rsy", REPO), "nami")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("RemoteUserSearchError(NotFound)"));
    }

    #[tokio::test]
    async fn credential_failures_are_classified() {
        let cluster = FakeCluster::new();
        cluster.add_user(remote_user("no-secret", "git.example.com"));
        cluster.add_user(remote_user("no-token", "git.example.com"));
        cluster.add_secret(basic_auth("no-token-creds", "usopp", None));
        cluster.add_user(remote_user("opaque", "git.example.com"));
        let mut opaque = basic_auth("opaque-creds", "usopp", Some("t"));
        opaque.type_ = Some("Opaque".to_string());
        cluster.add_secret(opaque);

        for (ru, expected) in [
            ("no-secret", "CredentialSearchError(SecretNotFound)"),
            ("no-token", "CredentialSearchError(TokenNotFound)"),
            ("opaque", "CredentialSearchError(WrongSecretType)"),
        ] {
            let remote_user = cluster.get_remote_user("test", ru).await.unwrap().unwrap();
            let err = credentials(&cluster, "test", &remote_user).await.unwrap_err();
            assert!(err.to_string().contains(expected), "{}: {}", ru, err);
        }
    }

    /// Story: S3, an unknown user falls back to the default RemoteUser
    #[tokio::test]
    async fn story_default_user_fallback() {
        let cluster = FakeCluster::new();
        cluster.add_user(remote_user("chopper", "git.example.com"));
        cluster.add_secret(basic_auth("chopper-creds", "chopper", Some("t")));
        cluster.add_user(remote_user("robin", "gitlab.com"));

        let mut rsy = syncer("rsy", REPO);
        let err = resolve_identity(&cluster, &rsy, "sanji").await.unwrap_err();
        assert!(err.to_string().contains("RemoteUserBindingNotFoundError"));

        rsy.spec.default_unauthorized_user_mode = UnauthorizedUserMode::UseDefaultUser;
        rsy.spec.default_remote_user_ref = Some(ObjectRef::new("chopper"));
        let identity = resolve_identity(&cluster, &rsy, "sanji").await.unwrap();
        assert_eq!(identity.author.username, "chopper");
        assert!(identity.binding.is_none());

        rsy.spec.default_remote_user_ref = Some(ObjectRef::new("robin"));
        let err = resolve_identity(&cluster, &rsy, "sanji").await.unwrap_err();
        assert!(err.to_string().contains("DefaultRemoteTargetMismatchError"));

        rsy.spec.default_remote_user_ref = Some(ObjectRef::new("brook"));
        let err = resolve_identity(&cluster, &rsy, "sanji").await.unwrap_err();
        assert!(err.to_string().contains("DefaultRemoteUserNotFoundError"));
    }

    #[test]
    fn ports_may_appear_in_the_fqdn() {
        let url = GitUrl::parse("https://git.example.com:8443/a.git").unwrap();
        assert!(serves_host(&remote_user("a", "git.example.com"), &url));
        assert!(serves_host(&remote_user("a", "Git.Example.com:8443"), &url));
        assert!(!serves_host(&remote_user("a", "git.example.com:9000"), &url));
    }

    #[tokio::test]
    async fn unparseable_repositories_are_reported() {
        let cluster = FakeCluster::new();
        let err = resolve_identity(&cluster, &syncer("rsy", "not a url"), "luffy")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("GitUrlParseError"));
    }
}
