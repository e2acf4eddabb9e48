//! Diagnostics error types.

use thiserror::Error;

use store::StoreError;

#[derive(Debug, Error)]
pub enum DiagnosticsError {
    /// The full-collection read failed.
    #[error("snapshot of '{collection}' failed: {source}")]
    Snapshot {
        collection: String,
        #[source]
        source: StoreError,
    },

    /// A batch delete failed.  Earlier batches stay deleted.
    #[error("batch delete in '{collection}' failed after {deleted} deletions: {source}")]
    Delete {
        collection: String,
        deleted: usize,
        #[source]
        source: StoreError,
    },

    #[error("deletion plan for '{collection}' has not been approved")]
    NotApproved { collection: String },
}
