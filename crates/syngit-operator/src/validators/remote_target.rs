//! RemoteTarget webhook

use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};

use syngit_common::crd::{RemoteTarget, RemoteTargetSpec};
use syngit_common::git_url::GitUrl;
use syngit_common::{Error, Result};

use super::{respond, submitted};
use crate::context::Context;

/// Shape checks of a RemoteTarget
///
/// An empty `targetRepository` is accepted: fork targets are created before
/// the fork exists.
pub fn validate_spec(spec: &RemoteTargetSpec) -> Result<()> {
    GitUrl::parse(&spec.upstream_repository)?;
    if !spec.target_repository.is_empty() {
        GitUrl::parse(&spec.target_repository)?;
    }
    if spec.upstream_branch.trim().is_empty() {
        return Err(Error::validation("spec.upstreamBranch must not be empty"));
    }
    if spec.target_branch.trim().is_empty() {
        return Err(Error::validation("spec.targetBranch must not be empty"));
    }
    spec.validate()
}

/// `/validate-syngit-io-v1beta3-remotetarget`
pub async fn validate(_ctx: &Context, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let result = submitted::<RemoteTarget>(request)
        .and_then(|target| target.map_or(Ok(()), |t| validate_spec(&t.spec)));
    respond(request, result)
}
