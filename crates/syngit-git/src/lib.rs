//! Git engine for syngit
//!
//! One call to [`push`] materializes one intercepted object on one
//! RemoteTarget:
//!
//! 1. fetch the target repository (and the upstream when a merge strategy is set)
//! 2. pick the base commit according to the merge strategy
//! 3. place the manifest (constructed path, or an existing document found by the ResourceFinder)
//! 4. write or delete it, commit, and push
//!
//! Work happens in a temporary bare repository that is removed when the call
//! returns, so every request starts from a fresh fetch. The engine knows nothing
//! about users or policies; callers hand it a fully resolved [`PushRequest`].

mod engine;
mod error;
pub mod finder;
pub mod path;
mod request;
pub mod tls;
mod tree;
mod worktree;

pub use engine::push;
pub use error::{GitError, GitErrorKind};
pub use request::{Author, PushOutcome, PushRequest, ResourceRef, TlsSettings};

/// Remote name of the repository receiving the push
pub const ORIGIN: &str = "origin";

/// Remote name of the repository the target derives from
pub const UPSTREAM: &str = "upstream";

#[cfg(test)]
pub(crate) mod testutil;
