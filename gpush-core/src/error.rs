//! Error types for the gpush engine.
//!
//! The taxonomy mirrors how failures are handled, not where they occur:
//! `User` errors carry actionable text and are expected to be resolved by
//! re-running with different input; `State` and `Internal` errors mean the
//! tool refuses to proceed rather than risk corrupting the replicated
//! state ledger; `Process` and `Proto` cover the external world.

use thiserror::Error;

/// All errors produced by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Ambiguous or invalid input; the user can fix it and retry.
    #[error("{0}")]
    User(String),

    /// The persisted state ledger (or the in-memory registry derived from
    /// it) violates a consistency invariant. Fatal: resolving it by
    /// guessing could corrupt state replicated to other machines.
    #[error("state error: {0}")]
    State(String),

    /// A programming invariant was broken (e.g. registering the same
    /// commit id twice). Always a defect, never a user problem.
    #[error("internal error: {0}")]
    Internal(String),

    /// The review server returned an object missing a normally-mandatory
    /// field. Indicates a protocol mismatch, not bad user data.
    #[error("gerrit protocol error: {0}")]
    Proto(String),

    /// An external command exited non-zero (outside a soft-fail call site)
    /// or could not be spawned.
    #[error("command failed: {cmd}: {detail}")]
    Process { cmd: String, detail: String },

    #[error(transparent)]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors the user is expected to fix by adjusting input
    /// (as opposed to defects and external failures).
    pub fn is_user(&self) -> bool {
        matches!(self, Error::User(_))
    }
}
