//! Typed errors at the core boundary.
//!
//! Exception-driven "not found"/"conflict" control flow from the source
//! system is replaced by explicit result variants, translated to HTTP
//! status codes at the `flow-cli` REST edge.

use thiserror::Error;

/// Error surfaced by core operations.
#[derive(Debug, Error)]
pub enum FlowError {
    /// The referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An optimistic-lock or uniqueness conflict; the caller should retry
    /// or treat this as a benign race, per the operation's semantics.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The request is structurally invalid (e.g. a malformed definition or
    /// a dispatch condition with no matching branch and no `"otherwise"`).
    #[error("invalid: {0}")]
    Invalid(String),

    /// A fatal invariant violation: a programming error, not a user
    /// condition. Never retried.
    #[error("fatal: {0}")]
    Fatal(String),

    /// An underlying infrastructure failure (database, I/O).
    #[error(transparent)]
    Infra(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;
