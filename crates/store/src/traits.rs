//! The `DocumentStore` trait: the contract every backend must fulfil.

use async_trait::async_trait;

use crate::{Document, Query, Snapshot, StoreError};

/// Remote document store.
///
/// Timeouts and retries belong to the backend client; callers add none.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Run an ordered/filtered query.
    ///
    /// Backends must reject an `in` filter carrying more than
    /// [`IN_FILTER_CEILING`](crate::IN_FILTER_CEILING) values with
    /// [`StoreError::InvalidArgument`].
    async fn query(&self, query: &Query) -> Result<Snapshot, StoreError>;

    /// Fetch one document by id.  `Ok(None)` when it does not exist.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Atomically delete the given documents; ids that do not exist are
    /// ignored.  Returns the number of documents actually removed.
    async fn batch_delete(&self, collection: &str, ids: &[String]) -> Result<usize, StoreError>;
}
