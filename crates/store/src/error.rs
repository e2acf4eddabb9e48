//! Store-level error type.

use thiserror::Error;

/// Errors returned by a [`DocumentStore`](crate::DocumentStore) call.
///
/// The data layer uses the variant only for logging and for
/// [`StoreError::is_transient`]; every variant is recovered the same way on
/// the best-effort paths.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Network failure or backend temporarily unreachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The caller is not allowed to read or write this collection.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The query itself is malformed (e.g. too many values in an `in` filter).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A document addressed by id does not exist.
    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    /// Anything else the backend reports.
    #[error("internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether retrying the same call later could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Internal(_))
    }
}
