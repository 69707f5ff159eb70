//! Admission pipeline: one intercepted write in, one verdict out
//!
//! Stages, in order:
//!
//! 1. record the observed request
//! 2. let bypass subjects through
//! 3. resolve the Git identity, run the user-specific pattern, resolve targets
//! 4. render the object (empty on DELETE)
//! 5. let objects that are being finalized through
//! 6. resolve the CA bundle of the Git host
//! 7. push to every target in turn
//! 8. turn the strategy into a verdict
//!
//! Any failure denies the write and sets `Synced=False` on the RemoteSyncer.

use chrono::Utc;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use syngit_common::crd::{
    LastBypassedObjectState, LastObservedObjectState, LastPushedObjectState, PushedTarget,
    RemoteSyncer, Strategy,
};
use syngit_common::git_url::GitUrl;
use syngit_common::render::render_yaml;
use syngit_common::yaml::parse_string_list;
use syngit_common::{Error, Result, EXCLUDED_FIELDS_KEY, LABEL_CLUSTER_DEFAULT_EXCLUDED_FIELDS};
use syngit_git::{PushRequest, TlsSettings};

use super::identity::resolve_identity;
use super::status::{record, StatusChange};
use super::target::resolve_targets;
use super::{allow, deny, deny_error, RequestDetails};
use crate::context::Context;
use crate::pattern::{trigger, PatternError, UserSpecificPattern};

/// Secret type required for CA bundles
pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

enum Verdict {
    Allow,
    Deny(String),
}

enum Failure {
    Error(Error),
    Pattern(PatternError),
}

impl From<Error> for Failure {
    fn from(err: Error) -> Self {
        Failure::Error(err)
    }
}

impl From<PatternError> for Failure {
    fn from(err: PatternError) -> Self {
        Failure::Pattern(err)
    }
}

/// Run the pipeline for `request` against `syncer`
#[instrument(
    skip_all,
    fields(
        syncer = %syncer.name_any(),
        namespace = %syncer.namespace().unwrap_or_default(),
        uid = %request.uid,
    )
)]
pub async fn run(
    ctx: &Context,
    syncer: &RemoteSyncer,
    request: &AdmissionRequest<DynamicObject>,
    cancel: &CancellationToken,
) -> AdmissionResponse {
    let namespace = syncer.namespace().unwrap_or_default();
    let name = syncer.name_any();

    let details = match RequestDetails::from_request(request) {
        Ok(details) => details,
        Err(e) => return deny_error(request, &e),
    };

    record(
        ctx.cluster.as_ref(),
        &ctx.status_locks,
        &namespace,
        &name,
        StatusChange::Observed(LastObservedObjectState {
            last_observed: Utc::now(),
            last_user_info: details.user.clone(),
            last_observed_object: details.observed_object(),
        }),
    )
    .await;

    let failure = match intercept(ctx, syncer, &details, cancel).await {
        Ok(Verdict::Allow) => return allow(request),
        Ok(Verdict::Deny(message)) => return deny(request, 403, message),
        Err(failure) => failure,
    };

    let (message, response) = match failure {
        Failure::Error(e) => (e.to_string(), deny_error(request, &e)),
        Failure::Pattern(p) => (p.to_string(), deny(request, p.code(), &p)),
    };
    warn!(user = %details.username(), error = %message, "interception failed");
    record(
        ctx.cluster.as_ref(),
        &ctx.status_locks,
        &namespace,
        &name,
        StatusChange::Failed(message),
    )
    .await;
    response
}

async fn intercept(
    ctx: &Context,
    syncer: &RemoteSyncer,
    details: &RequestDetails,
    cancel: &CancellationToken,
) -> std::result::Result<Verdict, Failure> {
    let cluster = ctx.cluster.as_ref();
    let namespace = syncer.namespace().unwrap_or_default();
    let username = details.username();

    if is_bypass_subject(syncer, username)? {
        debug!(user = %username, "bypass subject, not intercepting");
        record(
            cluster,
            &ctx.status_locks,
            &namespace,
            &syncer.name_any(),
            StatusChange::Bypassed(LastBypassedObjectState {
                last_bypassed: Utc::now(),
                last_user_info: details.user.clone(),
                last_bypassed_object: details.observed_object(),
            }),
        )
        .await;
        return Ok(Verdict::Allow);
    }

    let identity = resolve_identity(cluster, syncer, username).await?;
    let binding = match identity.binding {
        Some(binding) => {
            let mut pattern = UserSpecificPattern::new(cluster, syncer, username, binding);
            trigger(&mut pattern).await?;
            Some(pattern.into_binding())
        }
        None => None,
    };
    let targets = resolve_targets(cluster, syncer, binding.as_ref()).await?;

    let yaml = match &details.object {
        Some(object) if !details.is_deletion() => {
            let excluded = excluded_fields(ctx, syncer).await?;
            render_yaml(object, &excluded)?
        }
        _ => String::new(),
    };

    if details.being_deleted {
        debug!("object is being finalized, not pushing");
        return Ok(Verdict::Allow);
    }
    if details.dry_run {
        debug!("dry run, not pushing");
        return Ok(verdict(syncer));
    }

    let url = GitUrl::parse(&syncer.spec.remote_repository)?;
    let tls = TlsSettings {
        insecure_skip_verify: syncer.spec.insecure_skip_tls_verify,
        ca_bundle: ca_bundle(ctx, syncer, &url.host).await?,
    };

    let mut pushed = Vec::with_capacity(targets.len());
    for target in &targets {
        if cancel.is_cancelled() {
            return Err(Error::internal_with_context(
                "push",
                "request cancelled before every target was pushed",
            )
            .into());
        }
        let push = PushRequest {
            upstream_repository: target.spec.upstream_repository.clone(),
            upstream_branch: target.spec.upstream_branch.clone(),
            target_repository: target.spec.target_repository.clone(),
            target_branch: target.spec.target_branch.clone(),
            merge_strategy: target.spec.merge_strategy,
            root_path: syncer.spec.root_path.clone(),
            resource: details.resource.clone(),
            yaml: yaml.clone(),
            author: identity.author.clone(),
            tls: tls.clone(),
            resource_finder: ctx.feature_gates.resource_finder,
        };
        let outcome = ctx.pusher.push(push, cancel.clone()).await?;
        info!(
            target = %target.name_any(),
            branch = %outcome.branch,
            path = %outcome.path,
            commit = %outcome.commit_hash,
            committed = outcome.committed,
            "pushed"
        );
        pushed.push(PushedTarget {
            repository: outcome.repository,
            branch: outcome.branch,
            path: outcome.path,
            commit_hash: outcome.commit_hash,
        });
    }

    record(
        cluster,
        &ctx.status_locks,
        &namespace,
        &syncer.name_any(),
        StatusChange::Pushed(LastPushedObjectState {
            last_pushed: Utc::now(),
            last_pushed_object: details.observed_object(),
            last_pushed_git_user: identity.author.username.clone(),
            last_pushed_targets: pushed,
        }),
    )
    .await;

    Ok(verdict(syncer))
}

fn verdict(syncer: &RemoteSyncer) -> Verdict {
    match syncer.spec.strategy {
        Strategy::CommitApply => Verdict::Allow,
        Strategy::CommitOnly => Verdict::Deny(syncer.block_applied_message()),
    }
}

/// Whether `username` is a bypass subject; duplicated subject names are an error
fn is_bypass_subject(syncer: &RemoteSyncer, username: &str) -> Result<bool> {
    let subjects = &syncer.spec.bypass_interception_subjects;
    for (i, subject) in subjects.iter().enumerate() {
        if subjects[..i].iter().any(|s| s.name == subject.name) {
            return Err(Error::NonUniqueUser {
                name: subject.name.clone(),
            });
        }
    }
    Ok(subjects.iter().any(|s| s.matches_username(username)))
}

/// Cluster defaults, then inline paths, then the referenced ConfigMap
async fn excluded_fields(ctx: &Context, syncer: &RemoteSyncer) -> Result<Vec<String>> {
    let selector = format!("{}=true", LABEL_CLUSTER_DEFAULT_EXCLUDED_FIELDS);
    let mut fields = Vec::new();
    for cm in ctx
        .cluster
        .list_config_maps(&ctx.manager_namespace, &selector)
        .await?
    {
        fields.extend(config_map_fields(&cm)?);
    }

    fields.extend(syncer.spec.excluded_fields.iter().cloned());

    if let Some(reference) = &syncer.spec.excluded_fields_config_map_ref {
        let namespace = syncer.namespace().unwrap_or_default();
        let cm = ctx
            .cluster
            .get_config_map(&namespace, &reference.name)
            .await?
            .ok_or_else(|| Error::not_found("ConfigMap", &reference.name))?;
        fields.extend(config_map_fields(&cm)?);
    }
    Ok(fields)
}

fn config_map_fields(cm: &ConfigMap) -> Result<Vec<String>> {
    match cm.data.as_ref().and_then(|d| d.get(EXCLUDED_FIELDS_KEY)) {
        Some(raw) => parse_string_list(raw),
        None => Ok(Vec::new()),
    }
}

/// CA bundle for the Git host
///
/// An explicit reference must resolve; the host-keyed secret in the manager
/// namespace is optional.
async fn ca_bundle(ctx: &Context, syncer: &RemoteSyncer, host: &str) -> Result<Option<Vec<u8>>> {
    let (namespace, name, explicit) = match &syncer.spec.ca_bundle_secret_ref {
        Some(reference) => (
            reference
                .namespace
                .clone()
                .unwrap_or_else(|| syncer.namespace().unwrap_or_default()),
            reference.name.clone(),
            true,
        ),
        None => (
            ctx.manager_namespace.clone(),
            format!("{}-ca-bundle", host),
            false,
        ),
    };

    let Some(secret) = ctx.cluster.get_secret(&namespace, &name).await? else {
        if explicit {
            return Err(Error::not_found("Secret", name));
        }
        return Ok(None);
    };
    ca_from_secret(&secret).map(Some)
}

fn ca_from_secret(secret: &Secret) -> Result<Vec<u8>> {
    let found = secret.type_.clone().unwrap_or_default();
    if found != TLS_SECRET_TYPE {
        return Err(Error::CaSecretWrongType {
            secret: secret.name_any(),
            found,
        });
    }
    let data = secret.data.as_ref();
    data.and_then(|d| d.get("ca.crt").or_else(|| d.get("tls.crt")))
        .map(|bytes| bytes.0.clone())
        .ok_or_else(|| {
            Error::validation(format!(
                "the CA bundle secret {} has neither ca.crt nor tls.crt",
                secret.name_any()
            ))
        })
}
