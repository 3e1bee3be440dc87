//! Crate-wide error taxonomy.
//!
//! Each subsystem keeps its own local error enum (as the predecessor
//! codebase did per-module: `CheckpointerError`, `JsonError`,
//! `SQLiteCheckpointerError`) and converts into [`RagError`] at the
//! boundary where the distinction stops mattering to the caller.

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum RagError {
    #[error("validation failed: {0}")]
    #[diagnostic(code(ragweave::validation))]
    Validation(String),

    #[error("dependency unavailable ({provider}): {message}")]
    #[diagnostic(
        code(ragweave::dependency_unavailable),
        help("The {provider} dependency is down or returned an error; retry or check its health.")
    )]
    DependencyUnavailable { provider: &'static str, message: String },

    #[error("policy rejected: {0}")]
    #[diagnostic(code(ragweave::policy_reject))]
    PolicyReject(String),

    #[error("not found: {0}")]
    #[diagnostic(code(ragweave::not_found))]
    NotFound(String),

    #[error("invariant violation: {0}")]
    #[diagnostic(
        code(ragweave::invariant_violation),
        help("This should not happen; the offending item was skipped rather than crashing the worker.")
    )]
    Invariant(String),

    #[error(transparent)]
    #[diagnostic(code(ragweave::state_store))]
    StateStore(#[from] crate::state_store::StateStoreError),

    #[error(transparent)]
    #[diagnostic(code(ragweave::storage))]
    Storage(#[from] crate::storage::StorageError),

    #[error(transparent)]
    #[diagnostic(code(ragweave::json))]
    Json(#[from] crate::utils::json_ext::JsonError),

    #[error(transparent)]
    #[diagnostic(code(ragweave::serde_json))]
    Serde(#[from] serde_json::Error),
}

pub type RagResult<T> = Result<T, RagError>;
