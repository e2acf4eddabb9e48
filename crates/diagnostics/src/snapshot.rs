//! Full-collection reads for offline analysis.

use tracing::{info, instrument};

use store::{Document, DocumentStore, Filter, Query};

use crate::DiagnosticsError;

/// Every record of `collection` matching the `scope` equality filters,
/// unordered and unpaginated.
#[instrument(skip(store, scope), fields(filters = scope.len()))]
pub async fn fetch_collection(
    store: &dyn DocumentStore,
    collection: &str,
    scope: &[Filter],
) -> Result<Vec<Document>, DiagnosticsError> {
    let query = Query::collection(collection).filters(scope.iter().cloned());
    let snapshot = store
        .query(&query)
        .await
        .map_err(|source| DiagnosticsError::Snapshot {
            collection: collection.to_owned(),
            source,
        })?;
    info!(records = snapshot.len(), "snapshot loaded");
    Ok(snapshot.documents)
}
