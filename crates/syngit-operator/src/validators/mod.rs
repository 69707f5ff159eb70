//! Static validating webhooks for the syngit custom resources
//!
//! Shape checks (`/validate-syngit-io-v1beta3-*`), authorization checks
//! issued as SubjectAccessReviews on behalf of the requesting user, and the
//! endpoints that drive the target patterns.

pub mod remote_syncer;
pub mod remote_target;
pub mod remote_user;
pub mod remote_user_binding;

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::Resource;
use serde::de::DeserializeOwned;
use tracing::debug;

use syngit_common::Result;

use crate::admission::{allow, decode, deny, deny_error, parse_review};
use crate::cluster::AccessReview;
use crate::pattern::PatternError;
use crate::server::WebhookState;

/// Shape of RemoteSyncers
pub const VALIDATE_REMOTE_SYNCER: &str = "/validate-syngit-io-v1beta3-remotesyncer";
/// Shape of RemoteTargets
pub const VALIDATE_REMOTE_TARGET: &str = "/validate-syngit-io-v1beta3-remotetarget";
/// Shape of RemoteUsers
pub const VALIDATE_REMOTE_USER: &str = "/validate-syngit-io-v1beta3-remoteuser";
/// Shape of RemoteUserBindings
pub const VALIDATE_REMOTE_USER_BINDING: &str = "/validate-syngit-io-v1beta3-remoteuserbinding";
/// The requester may perform every scoped operation
pub const REMOTE_SYNCER_RULES_PERMISSIONS: &str = "/syngit-v1beta3-remotesyncer-rules-permissions";
/// One-or-many-branches and user-specific patterns on RemoteSyncer writes
pub const REMOTE_SYNCER_TARGET_PATTERN: &str = "/syngit-v1beta3-remotesyncer-target-pattern";
/// Association pattern on RemoteUser writes
pub const REMOTE_USER_ASSOCIATION: &str = "/syngit-v1beta3-remoteuser-association";
/// The requester may read the credentials Secret
pub const REMOTE_USER_PERMISSIONS: &str = "/syngit-v1beta3-remoteuser-permissions";
/// The requester may read every referenced RemoteUser
pub const REMOTE_USER_BINDING_PERMISSIONS: &str = "/syngit-v1beta3-remoteuserbinding-permissions";

macro_rules! admission_handler {
    ($handler:ident, $validate:path) => {
        async fn $handler(
            State(state): State<Arc<WebhookState>>,
            Json(body): Json<AdmissionReview<DynamicObject>>,
        ) -> Json<AdmissionReview<DynamicObject>> {
            let request = match parse_review(body) {
                Ok(request) => request,
                Err(response) => return Json(response.into_review()),
            };
            let response = $validate(&state.ctx, &request).await;
            debug!(
                uid = %request.uid,
                webhook = stringify!($handler),
                allowed = response.allowed,
                "validated"
            );
            Json(response.into_review())
        }
    };
}

admission_handler!(remote_syncer_handler, remote_syncer::validate);
admission_handler!(remote_target_handler, remote_target::validate);
admission_handler!(remote_user_handler, remote_user::validate);
admission_handler!(remote_user_binding_handler, remote_user_binding::validate);
admission_handler!(rules_permissions_handler, remote_syncer::rules_permissions);
admission_handler!(target_pattern_handler, remote_syncer::target_pattern);
admission_handler!(association_handler, remote_user::association);
admission_handler!(remote_user_permissions_handler, remote_user::permissions);
admission_handler!(binding_permissions_handler, remote_user_binding::permissions);

/// Routes of every static validator
pub fn routes() -> Router<Arc<WebhookState>> {
    Router::new()
        .route(VALIDATE_REMOTE_SYNCER, post(remote_syncer_handler))
        .route(VALIDATE_REMOTE_TARGET, post(remote_target_handler))
        .route(VALIDATE_REMOTE_USER, post(remote_user_handler))
        .route(VALIDATE_REMOTE_USER_BINDING, post(remote_user_binding_handler))
        .route(REMOTE_SYNCER_RULES_PERMISSIONS, post(rules_permissions_handler))
        .route(REMOTE_SYNCER_TARGET_PATTERN, post(target_pattern_handler))
        .route(REMOTE_USER_ASSOCIATION, post(association_handler))
        .route(REMOTE_USER_PERMISSIONS, post(remote_user_permissions_handler))
        .route(REMOTE_USER_BINDING_PERMISSIONS, post(binding_permissions_handler))
}

/// Verdict for a check result
fn respond(request: &AdmissionRequest<DynamicObject>, result: Result<()>) -> AdmissionResponse {
    match result {
        Ok(()) => allow(request),
        Err(e) => {
            debug!(uid = %request.uid, error = %e, "denied");
            deny_error(request, &e)
        }
    }
}

/// Verdict for a pattern run
fn respond_pattern(
    request: &AdmissionRequest<DynamicObject>,
    result: std::result::Result<(), PatternError>,
) -> AdmissionResponse {
    match result {
        Ok(()) => allow(request),
        Err(e) => deny(request, e.code(), &e),
    }
}

/// Submitted object; absent on DELETE
fn submitted<K>(request: &AdmissionRequest<DynamicObject>) -> Result<Option<K>>
where
    K: DeserializeOwned + Resource,
{
    if request.operation == Operation::Delete {
        return Ok(None);
    }
    request
        .object
        .as_ref()
        .map(|obj| in_namespace(decode(obj)?, request))
        .transpose()
}

/// Stored object; absent on CREATE
fn previous<K>(request: &AdmissionRequest<DynamicObject>) -> Result<Option<K>>
where
    K: DeserializeOwned + Resource,
{
    request
        .old_object
        .as_ref()
        .map(|obj| in_namespace(decode(obj)?, request))
        .transpose()
}

// Objects submitted on CREATE may not carry their namespace yet.
fn in_namespace<K: Resource>(mut obj: K, request: &AdmissionRequest<DynamicObject>) -> Result<K> {
    if obj.meta().namespace.is_none() {
        obj.meta_mut().namespace = request.namespace.clone();
    }
    Ok(obj)
}

/// Access review on behalf of the requesting user
fn review_for(
    request: &AdmissionRequest<DynamicObject>,
    namespace: Option<String>,
    verb: &str,
    (group, version, resource): (&str, &str, &str),
    name: Option<String>,
) -> AccessReview {
    AccessReview {
        user: request.user_info.username.clone().unwrap_or_default(),
        uid: request.user_info.uid.clone(),
        groups: request.user_info.groups.clone().unwrap_or_default(),
        namespace,
        verb: verb.to_string(),
        group: group.to_string(),
        version: version.to_string(),
        resource: resource.to_string(),
        name,
    }
}

/// Requesting user name
fn username(request: &AdmissionRequest<DynamicObject>) -> String {
    request.user_info.username.clone().unwrap_or_default()
}
