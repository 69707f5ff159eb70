//! Base commit selection per merge strategy

use git2::{Oid, Repository};
use syngit_common::crd::MergeStrategy;

/// Commit the new commit is built on, `None` for an unborn branch
///
/// `target` is the current head of the target branch, `upstream` the head of
/// the upstream branch; either may be absent.
pub(crate) fn select_base(
    repo: &Repository,
    strategy: Option<MergeStrategy>,
    target: Option<Oid>,
    upstream: Option<Oid>,
) -> Result<Option<Oid>, String> {
    match strategy {
        None => Ok(target),
        Some(MergeStrategy::TryFastForwardOrDie) => fast_forward(repo, target, upstream),
        Some(MergeStrategy::TryFastForwardOrHardReset) => {
            match fast_forward(repo, target, upstream) {
                Ok(base) => Ok(base),
                Err(reason) => {
                    tracing::info!(%reason, "fast-forward impossible, resetting the target to the upstream");
                    Ok(upstream)
                }
            }
        }
        Some(MergeStrategy::TryHardResetOrDie) => match upstream {
            Some(oid) => Ok(Some(oid)),
            None => Err("the upstream branch does not exist, nothing to reset to".to_string()),
        },
    }
}

fn fast_forward(
    repo: &Repository,
    target: Option<Oid>,
    upstream: Option<Oid>,
) -> Result<Option<Oid>, String> {
    let (target, upstream) = match (target, upstream) {
        (None, None) => return Ok(None),
        (Some(t), None) => return Ok(Some(t)),
        (None, Some(u)) => return Ok(Some(u)),
        (Some(t), Some(u)) => (t, u),
    };
    if target == upstream || descends(repo, target, upstream)? {
        return Ok(Some(target));
    }
    if descends(repo, upstream, target)? {
        return Ok(Some(upstream));
    }
    Err(format!(
        "the target {} and the upstream {} have diverged, fast-forward is not possible",
        target, upstream
    ))
}

fn descends(repo: &Repository, commit: Oid, ancestor: Oid) -> Result<bool, String> {
    repo.graph_descendant_of(commit, ancestor)
        .map_err(|e| e.message().to_string())
}
