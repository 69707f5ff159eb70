//! Git engine errors

use std::fmt;

use thiserror::Error;

/// Step of the push that failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GitErrorKind {
    /// Preparing the temporary repository
    Setup,
    /// Fetching a remote
    Fetch,
    /// Aligning the target branch with the upstream
    Merge,
    /// Resolving or validating the file path
    Path,
    /// Writing the tree or the commit
    Commit,
    /// Pushing to the target
    Push,
    /// The request deadline expired or the client went away
    Cancelled,
}

impl fmt::Display for GitErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GitErrorKind::Setup => "setup",
            GitErrorKind::Fetch => "fetch",
            GitErrorKind::Merge => "merge",
            GitErrorKind::Path => "path",
            GitErrorKind::Commit => "commit",
            GitErrorKind::Push => "push",
            GitErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Failure of a Git operation, with the context needed to act on it
#[derive(Debug, Error)]
#[error("{kind} {url} ({reference}) as {user}: {message}{}", render_progress(.progress))]
pub struct GitError {
    /// Failed step
    pub kind: GitErrorKind,
    /// Remote URL involved
    pub url: String,
    /// Reference involved
    pub reference: String,
    /// Git user performing the operation
    pub user: String,
    /// Error message
    pub message: String,
    /// Sideband and progress output captured from the remote
    pub progress: String,
}

fn render_progress(progress: &str) -> String {
    let trimmed = progress.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("\nremote output:\n{}", trimmed)
    }
}

impl From<GitError> for syngit_common::Error {
    fn from(err: GitError) -> Self {
        let message = format!("{}{}", err.message, render_progress(&err.progress));
        syngit_common::Error::Git {
            operation: err.kind.to_string(),
            url: err.url,
            reference: err.reference,
            user: err.user,
            message,
        }
    }
}
