//! Target patterns: auxiliary RemoteTargets and RemoteUserBindings kept in
//! step with annotations
//!
//! Every pattern runs the same lifecycle:
//!
//! ```text
//! Init -> Diff -> Clean
//!              -> Drift -> Remove -> Setup -> Done
//! ```
//!
//! `diff` only reads, `remove` deletes and unlinks, `setup` creates and links.
//! Running a pattern twice in a row leaves nothing to do the second time.

pub mod one_or_many_branches;
pub mod remote_user_association;
pub mod user_specific;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

pub use one_or_many_branches::OneOrManyBranchesPattern;
pub use remote_user_association::RemoteUserAssociationPattern;
pub use user_specific::UserSpecificPattern;

/// Outcome of a failed pattern phase
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PatternError {
    /// The change is refused on policy grounds
    #[error("{0}")]
    Denied(String),
    /// The pattern could not complete
    #[error("{0}")]
    Errored(String),
}

impl PatternError {
    /// Admission result code for this outcome
    pub fn code(&self) -> u16 {
        match self {
            PatternError::Denied(_) => 403,
            PatternError::Errored(_) => 500,
        }
    }
}

impl From<syngit_common::Error> for PatternError {
    fn from(err: syngit_common::Error) -> Self {
        if err.is_policy() {
            PatternError::Denied(err.to_string())
        } else {
            PatternError::Errored(err.to_string())
        }
    }
}

/// Lifecycle position of a pattern run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatternState {
    /// Not started
    Init,
    /// Computing what to change
    Diff,
    /// Nothing to change
    Clean,
    /// Changes pending
    Drift,
    /// Deleting and unlinking
    Remove,
    /// Creating and linking
    Setup,
    /// Changes applied
    Done,
    /// A phase failed
    Error,
}

/// A Diff/Remove/Setup reconciler
#[async_trait]
pub trait Pattern: Send {
    /// Pattern name used in logs
    fn name(&self) -> &'static str;

    /// Compute pending changes from live state; returns whether anything drifted
    async fn diff(&mut self) -> Result<bool, PatternError>;

    /// Apply the pending deletions
    async fn remove(&mut self) -> Result<(), PatternError>;

    /// Apply the pending creations and links
    async fn setup(&mut self) -> Result<(), PatternError>;
}

/// Run a pattern to completion, returning the state it stopped in
pub async fn trigger(pattern: &mut dyn Pattern) -> Result<PatternState, PatternError> {
    let name = pattern.name();
    let mut state = PatternState::Init;
    loop {
        let next = match state {
            PatternState::Init => Ok(PatternState::Diff),
            PatternState::Diff => pattern.diff().await.map(|drift| {
                if drift {
                    PatternState::Drift
                } else {
                    PatternState::Clean
                }
            }),
            PatternState::Drift => Ok(PatternState::Remove),
            PatternState::Remove => pattern.remove().await.map(|_| PatternState::Setup),
            PatternState::Setup => pattern.setup().await.map(|_| PatternState::Done),
            PatternState::Clean | PatternState::Done | PatternState::Error => return Ok(state),
        };
        match next {
            Ok(next) => {
                debug!(pattern = name, from = ?state, to = ?next, "pattern transition");
                state = next;
            }
            Err(e) => {
                debug!(pattern = name, from = ?state, to = ?PatternState::Error, error = %e, "pattern failed");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        drift: bool,
        fail_setup: bool,
        calls: Vec<&'static str>,
    }

    #[async_trait]
    impl Pattern for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn diff(&mut self) -> Result<bool, PatternError> {
            self.calls.push("diff");
            Ok(self.drift)
        }

        async fn remove(&mut self) -> Result<(), PatternError> {
            self.calls.push("remove");
            Ok(())
        }

        async fn setup(&mut self) -> Result<(), PatternError> {
            self.calls.push("setup");
            if self.fail_setup {
                return Err(PatternError::Errored("create failed".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn clean_patterns_stop_after_diff() {
        let mut pattern = Recorder::default();
        assert_eq!(trigger(&mut pattern).await.unwrap(), PatternState::Clean);
        assert_eq!(pattern.calls, vec!["diff"]);
    }

    #[tokio::test]
    async fn drift_runs_remove_then_setup() {
        let mut pattern = Recorder {
            drift: true,
            ..Default::default()
        };
        assert_eq!(trigger(&mut pattern).await.unwrap(), PatternState::Done);
        assert_eq!(pattern.calls, vec!["diff", "remove", "setup"]);
    }

    #[tokio::test]
    async fn failures_surface_with_their_code() {
        let mut pattern = Recorder {
            drift: true,
            fail_setup: true,
            ..Default::default()
        };
        let err = trigger(&mut pattern).await.unwrap_err();
        assert_eq!(err.code(), 500);
        assert_eq!(
            PatternError::from(syngit_common::Error::MultipleTarget { count: 2 }).code(),
            403
        );
    }
}
