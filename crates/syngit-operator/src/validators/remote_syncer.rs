//! RemoteSyncer webhooks

use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::ResourceExt;
use tracing::debug;

use syngit_common::crd::{RemoteSyncer, Strategy, UnauthorizedUserMode};
use syngit_common::git_url::is_valid_git_uri;
use syngit_common::render::is_valid_field_path;
use syngit_common::{Error, Result};

use super::{previous, respond, respond_pattern, review_for, submitted, username};
use crate::admission::identity::find_binding;
use crate::cluster::ClusterClient;
use crate::context::Context;
use crate::pattern::{trigger, OneOrManyBranchesPattern, PatternError, UserSpecificPattern};

const NO_MATCHES_FOR_KIND: &str = "no matches for kind";

/// Shape checks of a RemoteSyncer
pub fn validate_spec(syncer: &RemoteSyncer) -> Result<()> {
    let spec = &syncer.spec;

    if !is_valid_git_uri(&spec.remote_repository) {
        return Err(Error::validation(format!(
            "spec.remoteRepository {:?} is not a valid Git repository URL",
            spec.remote_repository
        )));
    }
    if spec.default_branch.trim().is_empty() {
        return Err(Error::validation("spec.defaultBranch must not be empty"));
    }

    match (
        spec.default_unauthorized_user_mode,
        spec.default_remote_user_ref.is_some(),
    ) {
        (UnauthorizedUserMode::UseDefaultUser, false) => {
            return Err(Error::validation(
                "spec.defaultRemoteUserRef is required when spec.defaultUnauthorizedUserMode is UseDefaultUser",
            ))
        }
        (UnauthorizedUserMode::Block, true) => {
            return Err(Error::validation(
                "spec.defaultRemoteUserRef is only allowed when spec.defaultUnauthorizedUserMode is UseDefaultUser",
            ))
        }
        _ => {}
    }
    if spec.default_remote_user_ref.is_some() != spec.default_remote_target_ref.is_some() {
        return Err(Error::validation(
            "spec.defaultRemoteUserRef and spec.defaultRemoteTargetRef must be set together",
        ));
    }

    if spec.default_block_applied_message.is_some() && spec.strategy != Strategy::CommitOnly {
        return Err(Error::validation(
            "spec.defaultBlockAppliedMessage is only allowed with the CommitOnly strategy",
        ));
    }

    if let Some(path) = spec.excluded_fields.iter().find(|p| !is_valid_field_path(p)) {
        return Err(Error::validation(format!(
            "spec.excludedFields: {:?} is not a valid field path",
            path
        )));
    }

    if let Some(reference) = &spec.ca_bundle_secret_ref {
        if reference.namespace.is_some() && reference.namespace != syncer.namespace() {
            return Err(Error::validation(format!(
                "spec.caBundleSecretRef: the secret {} must live in the namespace of the RemoteSyncer",
                reference.name
            )));
        }
    }

    let subjects = &spec.bypass_interception_subjects;
    for (i, subject) in subjects.iter().enumerate() {
        if subjects[..i].iter().any(|s| s.name == subject.name) {
            return Err(Error::NonUniqueUser {
                name: subject.name.clone(),
            });
        }
    }

    syncer.user_specific_mode()?;
    Ok(())
}

/// `/validate-syngit-io-v1beta3-remotesyncer`
pub async fn validate(_ctx: &Context, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let result = submitted::<RemoteSyncer>(request)
        .and_then(|syncer| syncer.as_ref().map(validate_spec).unwrap_or(Ok(())));
    respond(request, result)
}

fn verbs(operation: &str) -> &'static [&'static str] {
    match operation {
        "CREATE" => &["create"],
        "UPDATE" => &["update"],
        "DELETE" => &["delete"],
        "*" => &["create", "update", "delete"],
        _ => &[],
    }
}

fn describe(verb: &str, group: &str, version: &str, resource: &str) -> String {
    if group.is_empty() {
        format!("{} {}/{}", verb, version, resource)
    } else {
        format!("{} {}/{}/{}", verb, group, version, resource)
    }
}

/// Every scoped (group, version, resource, operation) the requester may not perform
pub async fn forbidden_scopes(
    cluster: &dyn ClusterClient,
    request: &AdmissionRequest<DynamicObject>,
    syncer: &RemoteSyncer,
) -> Result<Vec<String>> {
    let namespace = syncer.namespace();
    let mut forbidden = Vec::new();

    for rule in &syncer.spec.scoped_resources.rules {
        let groups = rule.api_groups.as_deref().unwrap_or_default();
        let versions = rule.api_versions.as_deref().unwrap_or_default();
        let resources = rule.resources.as_deref().unwrap_or_default();
        let operations = rule.operations.as_deref().unwrap_or_default();

        for group in groups {
            for version in versions {
                for resource in resources {
                    for verb in operations.iter().flat_map(|op| verbs(op)) {
                        let review = review_for(
                            request,
                            namespace.clone(),
                            verb,
                            (group.as_str(), version.as_str(), resource.as_str()),
                            None,
                        );
                        let decision = cluster.review_access(&review).await?;
                        if decision.allowed {
                            continue;
                        }
                        if decision.evaluation_error.contains(NO_MATCHES_FOR_KIND) {
                            debug!(group, version, resource, "resource does not exist, skipping");
                            continue;
                        }
                        forbidden.push(describe(verb, group, version, resource));
                    }
                }
            }
        }
    }
    Ok(forbidden)
}

/// `/syngit-v1beta3-remotesyncer-rules-permissions`
pub async fn rules_permissions(
    ctx: &Context,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    respond(request, check_rules(ctx.cluster.as_ref(), request).await)
}

async fn check_rules(
    cluster: &dyn ClusterClient,
    request: &AdmissionRequest<DynamicObject>,
) -> Result<()> {
    let Some(syncer) = submitted::<RemoteSyncer>(request)? else {
        return Ok(());
    };
    let forbidden = forbidden_scopes(cluster, request, &syncer).await?;
    if forbidden.is_empty() {
        return Ok(());
    }
    Err(Error::ResourceScopeForbidden {
        user: username(request),
        resources: forbidden.join(", "),
    })
}

/// `/syngit-v1beta3-remotesyncer-target-pattern`
///
/// Runs the one-or-many-branches pattern on the transition, then the
/// user-specific pattern for the requester's binding.
pub async fn target_pattern(
    ctx: &Context,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    respond_pattern(request, run_patterns(ctx, request).await)
}

async fn run_patterns(
    ctx: &Context,
    request: &AdmissionRequest<DynamicObject>,
) -> std::result::Result<(), PatternError> {
    let cluster = ctx.cluster.as_ref();
    let current = submitted::<RemoteSyncer>(request)?;
    let stored = previous::<RemoteSyncer>(request)?;
    let Some(namespace) = current
        .as_ref()
        .or(stored.as_ref())
        .and_then(|s| s.namespace())
    else {
        return Ok(());
    };

    let mut branches =
        OneOrManyBranchesPattern::new(cluster, namespace, current.as_ref(), stored.as_ref());
    trigger(&mut branches).await?;

    if let Some(syncer) = current.as_ref() {
        let user = username(request);
        if let Some(binding) = find_binding(cluster, syncer, &user).await? {
            let mut pattern = UserSpecificPattern::new(cluster, syncer, user, binding);
            trigger(&mut pattern).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::fixtures::request;
    use crate::admission::pusher::MockGitPusher;
    use crate::cluster::{AccessDecision, MockClusterClient};
    use crate::pattern::one_or_many_branches::branch_target;
    use crate::testing::{binding, managed_binding, syncer, FakeCluster};
    use serde_json::Value;
    use std::sync::Arc;
    use syngit_common::crd::{NamespacedObjectRef, ObjectRef, Subject};
    use syngit_common::{ANNOTATION_ONE_OR_MANY_BRANCHES, ANNOTATION_USER_SPECIFIC};

    const REPO: &str = "https://git.example.com/platform/cluster.git";
    const RSY: (&str, &str, &str) = ("syngit.io", "v1beta3", "remotesyncers");

    fn json(rsy: &RemoteSyncer) -> Value {
        serde_json::to_value(rsy).unwrap()
    }

    fn context(cluster: Arc<FakeCluster>) -> Context {
        Context::for_testing(cluster, Arc::new(MockGitPusher::new()))
    }

    #[test]
    fn well_formed_syncers_pass() {
        assert!(validate_spec(&syncer("rsy", REPO)).is_ok());
    }

    #[test]
    fn shape_rules_are_enforced() {
        let mut rsy = syncer("rsy", "git@github.com:team/repo.git");
        assert!(validate_spec(&rsy).is_err());

        rsy = syncer("rsy", REPO);
        rsy.spec.default_unauthorized_user_mode = UnauthorizedUserMode::UseDefaultUser;
        assert!(validate_spec(&rsy).is_err());
        rsy.spec.default_remote_user_ref = Some(ObjectRef::new("chopper"));
        assert!(validate_spec(&rsy).is_err());
        rsy.spec.default_remote_target_ref = Some(ObjectRef::new("rt"));
        assert!(validate_spec(&rsy).is_ok());
        rsy.spec.default_unauthorized_user_mode = UnauthorizedUserMode::Block;
        assert!(validate_spec(&rsy).is_err());

        rsy = syncer("rsy", REPO);
        rsy.spec.default_block_applied_message = Some("nope".to_string());
        assert!(validate_spec(&rsy).is_err());
        rsy.spec.strategy = Strategy::CommitOnly;
        assert!(validate_spec(&rsy).is_ok());

        rsy = syncer("rsy", REPO);
        rsy.spec.excluded_fields = vec!["metadata.annotations[kubectl.kubernetes.io/last-applied]".into()];
        assert!(validate_spec(&rsy).is_ok());
        rsy.spec.excluded_fields = vec!["metadata annotations".into()];
        assert!(validate_spec(&rsy).is_err());
    }

    #[test]
    fn cross_namespace_and_duplicate_references_are_rejected() {
        let mut rsy = syncer("rsy", REPO);
        rsy.spec.ca_bundle_secret_ref = Some(NamespacedObjectRef {
            name: "ca".to_string(),
            namespace: Some("elsewhere".to_string()),
        });
        assert!(validate_spec(&rsy).is_err());
        rsy.spec.ca_bundle_secret_ref = Some(NamespacedObjectRef {
            name: "ca".to_string(),
            namespace: Some("test".to_string()),
        });
        assert!(validate_spec(&rsy).is_ok());

        rsy.spec.bypass_interception_subjects = vec![Subject::user("luffy"), Subject::user("luffy")];
        assert!(matches!(validate_spec(&rsy), Err(Error::NonUniqueUser { .. })));
    }

    #[test]
    fn unknown_user_specific_modes_are_rejected() {
        let mut rsy = syncer("rsy", REPO);
        rsy.annotations_mut()
            .insert(ANNOTATION_USER_SPECIFIC.to_string(), "one-user-two-forks".to_string());
        assert!(validate_spec(&rsy).is_err());
    }

    #[tokio::test]
    async fn the_validate_endpoint_answers_deletes() {
        let rsy = syncer("rsy", "not a url");
        let req = request("DELETE", RSY, "luffy", None, Some(json(&rsy)));
        let response = validate(&context(Arc::new(FakeCluster::new())), &req).await;
        assert!(response.allowed);
    }

    /// Story: creating a syncer requires the rights it would exercise
    #[tokio::test]
    async fn story_rules_permissions() {
        let cluster = Arc::new(FakeCluster::new());
        let ctx = context(cluster.clone());
        let rsy = syncer("rsy", REPO);
        let req = request("CREATE", RSY, "luffy", Some(json(&rsy)), None);

        assert!(rules_permissions(&ctx, &req).await.allowed);

        cluster.deny_access("luffy", "delete", "configmaps");
        let response = rules_permissions(&ctx, &req).await;
        assert!(!response.allowed);
        assert_eq!(response.result.code, 403);
        assert!(response.result.message.contains("ResourceScopeForbiddenError"));
        assert!(response.result.message.contains("delete v1/configmaps"));
        assert!(!response.result.message.contains("create v1/configmaps"));
    }

    #[tokio::test]
    async fn missing_kinds_are_not_a_policy_failure() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.unknown_resource("configmaps");
        let rsy = syncer("rsy", REPO);
        let req = request("CREATE", RSY, "luffy", Some(json(&rsy)), None);
        assert!(rules_permissions(&context(cluster), &req).await.allowed);
    }

    #[tokio::test]
    async fn wildcard_operations_review_every_verb() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_review_access()
            .times(3)
            .returning(|review| {
                Ok(AccessDecision {
                    allowed: review.namespace.as_deref() == Some("test") && review.user == "luffy",
                    ..Default::default()
                })
            });
        let mut rsy = syncer("rsy", REPO);
        rsy.spec.scoped_resources.rules[0].operations = Some(vec!["*".to_string()]);
        let req = request("UPDATE", RSY, "luffy", Some(json(&rsy)), Some(json(&rsy)));
        let forbidden = forbidden_scopes(&cluster, &req, &rsy).await.unwrap();
        assert!(forbidden.is_empty());
    }

    /// Story: annotating a syncer materializes branch targets and the requester's own target
    #[tokio::test]
    async fn story_target_pattern_runs_both_patterns() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_binding(managed_binding("luffy-rub", "luffy", &["luffy-ru"], &[]));
        let ctx = context(cluster.clone());

        let mut rsy = syncer("rsy", REPO);
        rsy.annotations_mut()
            .insert(ANNOTATION_ONE_OR_MANY_BRANCHES.to_string(), "br1".to_string());
        rsy.annotations_mut()
            .insert(ANNOTATION_USER_SPECIFIC.to_string(), "one-user-one-branch".to_string());
        let req = request("CREATE", RSY, "luffy", Some(json(&rsy)), None);

        let response = target_pattern(&ctx, &req).await;
        assert!(response.allowed, "{}", response.result.message);

        let mut branches: Vec<String> = cluster
            .targets("test")
            .iter()
            .map(|t| t.spec.target_branch.clone())
            .collect();
        branches.sort();
        assert_eq!(branches, vec!["br1", "luffy"]);
        let rub = &cluster.bindings("test")[0];
        assert_eq!(rub.spec.remote_target_refs.len(), 2);

        let req = request("DELETE", RSY, "luffy", None, Some(json(&rsy)));
        assert!(target_pattern(&ctx, &req).await.allowed);
        let br1 = branch_target(&rsy, "br1").name_any();
        assert!(cluster.targets("test").iter().all(|t| t.name_any() != br1));
    }

    #[tokio::test]
    async fn bad_modes_are_denied_by_the_target_pattern() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_binding(binding("luffy-rub", "luffy", &[], &[]));
        let mut rsy = syncer("rsy", REPO);
        rsy.annotations_mut()
            .insert(ANNOTATION_USER_SPECIFIC.to_string(), "one-user-two-forks".to_string());
        let req = request("CREATE", RSY, "luffy", Some(json(&rsy)), None);
        let response = target_pattern(&context(cluster), &req).await;
        assert!(!response.allowed);
        assert_eq!(response.result.code, 403);
    }
}
