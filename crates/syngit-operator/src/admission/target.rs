//! Target resolution: which RemoteTargets receive the push

use kube::ResourceExt;
use tracing::debug;

use syngit_common::crd::{RemoteSyncer, RemoteTarget, RemoteUserBinding, TargetStrategy};
use syngit_common::kube_utils::label_selector_to_string;
use syngit_common::{Error, Result};

use crate::cluster::ClusterClient;

/// Targets of the binding that derive from the syncer's upstream, in binding order
///
/// Fork targets whose repository has not been provisioned yet are skipped.
pub async fn resolve_targets(
    cluster: &dyn ClusterClient,
    syncer: &RemoteSyncer,
    binding: Option<&RemoteUserBinding>,
) -> Result<Vec<RemoteTarget>> {
    let targets = match binding {
        Some(binding) => bound_targets(cluster, syncer, binding).await?,
        None => vec![default_target(cluster, syncer).await?],
    };

    if targets.is_empty() {
        return Err(Error::RemoteTargetNotFound {
            message: format!(
                "no RemoteTarget of the user derives from {} ({})",
                syncer.spec.remote_repository, syncer.spec.default_branch
            ),
        });
    }
    if syncer.spec.target_strategy == TargetStrategy::OneTarget && targets.len() > 1 {
        return Err(Error::MultipleTarget {
            count: targets.len(),
        });
    }
    Ok(targets)
}

async fn bound_targets(
    cluster: &dyn ClusterClient,
    syncer: &RemoteSyncer,
    binding: &RemoteUserBinding,
) -> Result<Vec<RemoteTarget>> {
    let namespace = syncer.namespace().unwrap_or_default();
    let selector = label_selector_to_string(syncer.spec.remote_target_selector.as_ref())?;
    let candidates = cluster.list_remote_targets(&namespace, &selector).await?;

    let mut targets = Vec::new();
    for reference in &binding.spec.remote_target_refs {
        let Some(target) = candidates.iter().find(|t| t.name_any() == reference.name) else {
            continue;
        };
        if !target
            .spec
            .has_upstream(&syncer.spec.remote_repository, &syncer.spec.default_branch)
        {
            continue;
        }
        if target.spec.target_repository.is_empty() {
            debug!(target = %reference.name, "skipping fork target without a repository yet");
            continue;
        }
        if !targets.iter().any(|t: &RemoteTarget| t.name_any() == reference.name) {
            targets.push(target.clone());
        }
    }
    Ok(targets)
}

async fn default_target(cluster: &dyn ClusterClient, syncer: &RemoteSyncer) -> Result<RemoteTarget> {
    let namespace = syncer.namespace().unwrap_or_default();
    let name = syncer
        .spec
        .default_remote_target_ref
        .as_ref()
        .map(|r| r.name.clone())
        .unwrap_or_default();
    let target = cluster
        .get_remote_target(&namespace, &name)
        .await?
        .ok_or_else(|| Error::DefaultRemoteTargetNotFound { name: name.clone() })?;
    if !target
        .spec
        .has_upstream(&syncer.spec.remote_repository, &syncer.spec.default_branch)
    {
        return Err(Error::RemoteTargetSearch {
            message: format!(
                "the default RemoteTarget {} derives from {} ({}), the RemoteSyncer from {} ({})",
                name,
                target.spec.upstream_repository,
                target.spec.upstream_branch,
                syncer.spec.remote_repository,
                syncer.spec.default_branch
            ),
        });
    }
    Ok(target)
}
