//! Seam between the admission pipeline and the Git engine

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use syngit_common::{Error, Result};
use syngit_git::{PushOutcome, PushRequest};

/// Materializes one object on one target
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GitPusher: Send + Sync {
    /// Fetch, align, write, commit and push
    async fn push(&self, request: PushRequest, cancel: CancellationToken) -> Result<PushOutcome>;
}

/// [`GitPusher`] backed by libgit2 on the blocking thread pool
#[derive(Clone, Copy, Debug, Default)]
pub struct Git2Pusher;

#[async_trait]
impl GitPusher for Git2Pusher {
    async fn push(&self, request: PushRequest, cancel: CancellationToken) -> Result<PushOutcome> {
        let outcome = tokio::task::spawn_blocking(move || syngit_git::push(&request, &cancel))
            .await
            .map_err(|e| Error::internal_with_context("git", format!("push task failed: {}", e)))?;
        Ok(outcome?)
    }
}
