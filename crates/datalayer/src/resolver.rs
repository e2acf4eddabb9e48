//! Batched foreign-key resolution.
//!
//! For each requested id the cache is consulted first.  Misses are split
//! into batches of at most `batch_ceiling` ids and looked up with one
//! identity `in` query per batch.  A batch query that fails is retried id by
//! id with single-document fetches, and individual failures there are
//! skipped.  Ids that nothing returned resolve to `None`: the reference may
//! point at a deleted document, which is a display concern, not an error.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use store::{Document, DocumentStore, Filter, Query};

use crate::cache::{CacheKey, ReferenceCache};
use crate::tolerant::run_tolerant;

// ---------------------------------------------------------------------------
// ReferenceField / ReferenceSet
// ---------------------------------------------------------------------------

/// A foreign-key field on primary records and the collection it points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReferenceField {
    pub field: String,
    pub collection: String,
}

impl ReferenceField {
    pub fn new(field: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            collection: collection.into(),
        }
    }
}

/// Deduplicated foreign-key ids, partitioned by target collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceSet {
    by_collection: BTreeMap<String, BTreeSet<String>>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect every non-empty string value of `fields` across `docs`.
    pub fn extract<'a>(
        docs: impl IntoIterator<Item = &'a Document>,
        fields: &[ReferenceField],
    ) -> Self {
        let mut set = Self::new();
        for doc in docs {
            for reference in fields {
                if let Some(id) = doc.str_field(&reference.field) {
                    set.insert(&reference.collection, id);
                }
            }
        }
        set
    }

    pub fn insert(&mut self, collection: &str, id: impl Into<String>) {
        self.by_collection
            .entry(collection.to_owned())
            .or_default()
            .insert(id.into());
    }

    pub fn ids(&self, collection: &str) -> Option<&BTreeSet<String>> {
        self.by_collection.get(collection)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.by_collection.iter()
    }

    /// Total number of distinct `(collection, id)` pairs.
    pub fn len(&self) -> usize {
        self.by_collection.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolution results for one collection: `None` marks an absent document.
pub type Resolution = HashMap<String, Option<Document>>;

/// Resolution results for a whole [`ReferenceSet`].
#[derive(Debug, Clone, Default)]
pub struct ResolvedReferences {
    by_collection: HashMap<String, Resolution>,
}

impl ResolvedReferences {
    /// `Some(Some(doc))` resolved, `Some(None)` absent, `None` never requested.
    pub fn lookup(&self, collection: &str, id: &str) -> Option<Option<&Document>> {
        self.by_collection
            .get(collection)
            .and_then(|r| r.get(id))
            .map(Option::as_ref)
    }

    pub fn collection(&self, collection: &str) -> Option<&Resolution> {
        self.by_collection.get(collection)
    }
}

// ---------------------------------------------------------------------------
// BatchReferenceResolver
// ---------------------------------------------------------------------------

pub struct BatchReferenceResolver {
    store: Arc<dyn DocumentStore>,
    cache: Arc<ReferenceCache>,
    batch_ceiling: usize,
}

impl BatchReferenceResolver {
    /// `batch_ceiling` is clamped to at least 1.
    pub fn new(store: Arc<dyn DocumentStore>, cache: Arc<ReferenceCache>, batch_ceiling: usize) -> Self {
        Self {
            store,
            cache,
            batch_ceiling: batch_ceiling.max(1),
        }
    }

    pub fn cache(&self) -> &Arc<ReferenceCache> {
        &self.cache
    }

    /// Resolve `ids` of `collection`.  Every requested id appears in the
    /// result, mapped to `None` when the document could not be found.
    #[instrument(skip(self, ids), fields(collection = %collection, requested = ids.len()))]
    pub async fn resolve(&self, collection: &str, ids: &BTreeSet<String>) -> Resolution {
        let mut resolved: Resolution = HashMap::with_capacity(ids.len());
        let mut misses: Vec<String> = Vec::new();

        for id in ids {
            match self.cache.get(&CacheKey::new(collection, id.as_str())) {
                Some(doc) => {
                    resolved.insert(id.clone(), Some(doc));
                }
                None => misses.push(id.clone()),
            }
        }

        debug!(
            cached = resolved.len(),
            to_fetch = misses.len(),
            "reference cache partition"
        );

        for batch in misses.chunks(self.batch_ceiling) {
            let query = Query::collection(collection).filter(Filter::id_in(batch.iter().cloned()));
            match self.store.query(&query).await {
                Ok(snapshot) => {
                    for doc in snapshot.documents {
                        self.cache.put(collection, doc.clone());
                        resolved.insert(doc.id.clone(), Some(doc));
                    }
                }
                Err(err) => {
                    warn!(
                        batch_size = batch.len(),
                        error = %err,
                        "batch lookup failed, falling back to single fetches"
                    );
                    self.resolve_one_by_one(collection, batch, &mut resolved).await;
                }
            }
        }

        for id in ids {
            resolved.entry(id.clone()).or_insert(None);
        }
        resolved
    }

    async fn resolve_one_by_one(&self, collection: &str, batch: &[String], resolved: &mut Resolution) {
        let store = &self.store;
        let outcome = run_tolerant("reference fallback fetch", batch.iter().cloned(), |id| async move {
            store.get(collection, &id).await
        })
        .await;

        for (id, found) in outcome.succeeded {
            match found {
                Some(doc) => {
                    self.cache.put(collection, doc.clone());
                    resolved.insert(id, Some(doc));
                }
                None => debug!(id = %id, "reference points at a missing document"),
            }
        }
    }

    /// Resolve every collection of a [`ReferenceSet`], one collection after
    /// another.
    pub async fn resolve_all(&self, set: &ReferenceSet) -> ResolvedReferences {
        let mut by_collection = HashMap::new();
        for (collection, ids) in set.iter() {
            let resolution = self.resolve(collection, ids).await;
            by_collection.insert(collection.clone(), resolution);
        }
        ResolvedReferences { by_collection }
    }
}
