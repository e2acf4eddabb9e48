//! Data-layer error types.

use thiserror::Error;

/// Errors that reach callers of the data layer.
///
/// Enrichment failures (reference batches, dependent collections) never
/// appear here; they degrade locally.  Only a failed primary page fetch
/// does, since there is no partial result worth returning.
#[derive(Debug, Error)]
pub enum DataLayerError {
    /// The primary page query failed.
    #[error("page fetch from '{collection}' failed: {source}")]
    PageFetch {
        collection: String,
        #[source]
        source: store::StoreError,
    },

    /// A cursor minted by a paginator with a different query shape was
    /// passed back in.
    #[error("cursor belongs to a different query shape")]
    ForeignCursor,
}
