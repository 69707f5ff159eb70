//! Admission path for intercepted cluster writes
//!
//! [`pipeline`] turns one AdmissionRequest into one verdict, using
//! [`identity`] and [`target`] to decide who pushes where, and [`status`] to
//! record what happened on the RemoteSyncer.

pub mod identity;
pub mod pipeline;
pub mod pusher;
pub mod status;
pub mod target;

use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use serde::de::DeserializeOwned;

use syngit_common::crd::{ObservedObject, ObservedUser};
use syngit_common::{Error, Result};
use syngit_git::ResourceRef;

/// What the pipeline needs to know about an admission request
#[derive(Clone, Debug, PartialEq)]
pub struct RequestDetails {
    /// Request UID, echoed in the response
    pub uid: String,
    /// Operation being admitted
    pub operation: Operation,
    /// Object being written
    pub resource: ResourceRef,
    /// Requesting user
    pub user: ObservedUser,
    /// Submitted object (absent on DELETE)
    pub object: Option<serde_json::Value>,
    /// Whether the submitted object already carries a deletionTimestamp
    pub being_deleted: bool,
    /// Whether the request is a dry run
    pub dry_run: bool,
}

impl RequestDetails {
    /// Extract the details of a request
    pub fn from_request(request: &AdmissionRequest<DynamicObject>) -> Result<Self> {
        let object = match &request.object {
            Some(obj) if request.operation != Operation::Delete => {
                Some(serde_json::to_value(obj)?)
            }
            _ => None,
        };
        let being_deleted = request
            .object
            .as_ref()
            .is_some_and(|obj| obj.metadata.deletion_timestamp.is_some());
        let name = if request.name.is_empty() {
            request
                .object
                .as_ref()
                .and_then(|obj| obj.metadata.name.clone())
                .unwrap_or_default()
        } else {
            request.name.clone()
        };

        Ok(Self {
            uid: request.uid.clone(),
            operation: request.operation.clone(),
            resource: ResourceRef {
                group: request.resource.group.clone(),
                version: request.resource.version.clone(),
                resource: request.resource.resource.clone(),
                name,
                namespace: request.namespace.clone(),
            },
            user: ObservedUser {
                username: request.user_info.username.clone().unwrap_or_default(),
                uid: request.user_info.uid.clone(),
                groups: request.user_info.groups.clone().unwrap_or_default(),
            },
            object,
            being_deleted,
            dry_run: request.dry_run,
        })
    }

    /// Whether the request deletes the object
    pub fn is_deletion(&self) -> bool {
        self.operation == Operation::Delete
    }

    /// Requesting user name
    pub fn username(&self) -> &str {
        &self.user.username
    }

    /// Object reference as recorded in RemoteSyncer status
    pub fn observed_object(&self) -> ObservedObject {
        ObservedObject {
            group: self.resource.group.clone(),
            version: self.resource.version.clone(),
            resource: self.resource.resource.clone(),
            name: self.resource.name.clone(),
            namespace: self.resource.namespace.clone(),
        }
    }
}

/// Decode an AdmissionReview, answering malformed reviews directly
pub fn parse_review(
    body: AdmissionReview<DynamicObject>,
) -> std::result::Result<AdmissionRequest<DynamicObject>, AdmissionResponse> {
    body.try_into().map_err(|e: kube::core::admission::ConvertAdmissionReviewError| {
        tracing::error!(error = %e, "failed to parse admission request");
        AdmissionResponse::invalid(Error::EmptyRequest.to_string())
    })
}

/// Allowing response for a request
pub fn allow(request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    AdmissionResponse::from(request)
}

/// Denying response with an explicit HTTP-like code
pub fn deny(
    request: &AdmissionRequest<DynamicObject>,
    code: u16,
    message: impl ToString,
) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(request).deny(message);
    response.result.code = code;
    response
}

/// Denying response for an error: 403 for policy failures, 500 otherwise
pub fn deny_error(request: &AdmissionRequest<DynamicObject>, err: &Error) -> AdmissionResponse {
    let code = if err.is_policy() { 403 } else { 500 };
    let mut response = deny(request, code, err);
    response.result.reason = err.reason().to_string();
    response
}

/// Decode the typed form of an admitted object
pub fn decode<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K> {
    let value = serde_json::to_value(obj)?;
    Ok(serde_json::from_value(value)?)
}
