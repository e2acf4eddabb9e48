//! `MemoryStore`: an in-process [`DocumentStore`].
//!
//! Used by unit and integration tests, and by the CLI to run the data layer
//! over a JSON snapshot file.  Every call is recorded so tests can assert
//! how many remote round-trips a component issued, and failures can be
//! injected per collection or per document.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::{Document, DocumentStore, Filter, Query, Snapshot, StoreError, IN_FILTER_CEILING};

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Query {
        collection: String,
        /// Number of values in the `in` filter, if the query had one.
        in_values: Option<usize>,
        ordered: bool,
    },
    Get {
        collection: String,
        id: String,
    },
    BatchDelete {
        collection: String,
        count: usize,
    },
}

#[derive(Default)]
struct Failures {
    /// Every query against the collection fails.
    queries: HashMap<String, StoreError>,
    /// Only `in`-filtered queries against the collection fail.
    in_queries: HashMap<String, StoreError>,
    /// Single-document fetches of these documents fail.
    gets: HashMap<(String, String), StoreError>,
    deletes: HashMap<String, StoreError>,
}

type Collections = BTreeMap<String, BTreeMap<String, Document>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory document store with call recording and failure injection.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<Collections>,
    calls: Mutex<Vec<StoreCall>>,
    failures: Mutex<Failures>,
    latency: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `latency` before answering, which makes calls
    /// suspend the way a real network round-trip does.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Build a store from `{ "<collection>": [ { "id": .., ... }, ... ] }`.
    ///
    /// Entries without a string `id` are skipped.
    pub fn from_value(value: &Value) -> Self {
        let store = Self::new();
        if let Some(map) = value.as_object() {
            for (collection, docs) in map {
                for doc in docs.as_array().into_iter().flatten() {
                    if let Some(id) = doc.get("id").and_then(Value::as_str) {
                        store.insert(collection, Document::new(id, doc.clone()));
                    }
                }
            }
        }
        store
    }

    /// Inverse of [`MemoryStore::from_value`].
    pub fn to_value(&self) -> Value {
        let collections = lock(&self.collections);
        let mut out = Map::new();
        for (name, docs) in collections.iter() {
            out.insert(
                name.clone(),
                Value::Array(docs.values().map(Document::to_value).collect()),
            );
        }
        Value::Object(out)
    }

    // -----------------------------------------------------------------------
    // Data seeding / inspection
    // -----------------------------------------------------------------------

    pub fn insert(&self, collection: &str, doc: Document) {
        lock(&self.collections)
            .entry(collection.to_owned())
            .or_default()
            .insert(doc.id.clone(), doc);
    }

    pub fn insert_many(&self, collection: &str, docs: impl IntoIterator<Item = Document>) {
        for doc in docs {
            self.insert(collection, doc);
        }
    }

    pub fn remove(&self, collection: &str, id: &str) -> Option<Document> {
        lock(&self.collections)
            .get_mut(collection)
            .and_then(|docs| docs.remove(id))
    }

    pub fn documents(&self, collection: &str) -> Vec<Document> {
        lock(&self.collections)
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, collection: &str) -> usize {
        lock(&self.collections)
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    pub fn collection_names(&self) -> Vec<String> {
        lock(&self.collections).keys().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Failure injection
    // -----------------------------------------------------------------------

    pub fn fail_queries(&self, collection: &str, err: StoreError) {
        lock(&self.failures)
            .queries
            .insert(collection.to_owned(), err);
    }

    pub fn fail_in_queries(&self, collection: &str, err: StoreError) {
        lock(&self.failures)
            .in_queries
            .insert(collection.to_owned(), err);
    }

    pub fn fail_get(&self, collection: &str, id: &str, err: StoreError) {
        lock(&self.failures)
            .gets
            .insert((collection.to_owned(), id.to_owned()), err);
    }

    pub fn fail_deletes(&self, collection: &str, err: StoreError) {
        lock(&self.failures)
            .deletes
            .insert(collection.to_owned(), err);
    }

    pub fn clear_failures(&self) {
        *lock(&self.failures) = Failures::default();
    }

    // -----------------------------------------------------------------------
    // Call recording
    // -----------------------------------------------------------------------

    /// All calls seen so far, in order.
    pub fn calls(&self) -> Vec<StoreCall> {
        lock(&self.calls).clone()
    }

    pub fn reset_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Number of queries of any shape against `collection`.
    pub fn query_count(&self, collection: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, StoreCall::Query { collection: name, .. } if name == collection))
            .count()
    }

    /// Number of `in`-filtered queries against `collection`.
    pub fn in_query_count(&self, collection: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| {
                matches!(c, StoreCall::Query { collection: name, in_values: Some(_), .. } if name == collection)
            })
            .count()
    }

    /// Number of single-document fetches against `collection`.
    pub fn get_count(&self, collection: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, StoreCall::Get { collection: name, .. } if name == collection))
            .count()
    }

    fn record(&self, call: StoreCall) {
        lock(&self.calls).push(call);
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn evaluate(&self, query: &Query) -> Result<Snapshot, StoreError> {
        for filter in &query.filters {
            if let Filter::In { values, .. } = filter {
                if values.is_empty() {
                    return Err(StoreError::InvalidArgument(
                        "'in' filter requires at least one value".into(),
                    ));
                }
                if values.len() > IN_FILTER_CEILING {
                    return Err(StoreError::InvalidArgument(format!(
                        "'in' filter accepts at most {IN_FILTER_CEILING} values, got {}",
                        values.len()
                    )));
                }
            }
        }

        let collections = lock(&self.collections);
        let mut docs: Vec<Document> = collections
            .get(&query.collection)
            .map(|docs| {
                docs.values()
                    .filter(|doc| query.filters.iter().all(|f| f.matches(doc)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(collections);

        match &query.order_by {
            Some(order) => {
                // Documents without the ordering field are not part of an
                // ordered result.
                docs.retain(|doc| doc.get(&order.field).is_some());
                docs.sort_by(|a, b| order.compare(a, b));
                if let Some(cursor) = &query.start_after {
                    let anchor = cursor.as_anchor(order);
                    docs.retain(|doc| order.compare(doc, &anchor) == std::cmp::Ordering::Greater);
                }
            }
            None => {
                if let Some(cursor) = &query.start_after {
                    docs.retain(|doc| doc.id > cursor.document_id);
                }
            }
        }

        if let Some(limit) = query.limit {
            docs.truncate(limit);
        }

        Ok(Snapshot {
            documents: docs,
            order_by: query.order_by.clone(),
        })
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn query(&self, query: &Query) -> Result<Snapshot, StoreError> {
        let in_values = query.filters.iter().find_map(|f| match f {
            Filter::In { values, .. } => Some(values.len()),
            Filter::Eq { .. } => None,
        });
        self.record(StoreCall::Query {
            collection: query.collection.clone(),
            in_values,
            ordered: query.order_by.is_some(),
        });
        self.simulate_latency().await;

        {
            let failures = lock(&self.failures);
            if let Some(err) = failures.queries.get(&query.collection) {
                return Err(err.clone());
            }
            if in_values.is_some() {
                if let Some(err) = failures.in_queries.get(&query.collection) {
                    return Err(err.clone());
                }
            }
        }

        let snapshot = self.evaluate(query)?;
        debug!(
            collection = %query.collection,
            returned = snapshot.len(),
            "memory store query"
        );
        Ok(snapshot)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.record(StoreCall::Get {
            collection: collection.to_owned(),
            id: id.to_owned(),
        });
        self.simulate_latency().await;

        if let Some(err) = lock(&self.failures)
            .gets
            .get(&(collection.to_owned(), id.to_owned()))
        {
            return Err(err.clone());
        }

        Ok(lock(&self.collections)
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn batch_delete(&self, collection: &str, ids: &[String]) -> Result<usize, StoreError> {
        self.record(StoreCall::BatchDelete {
            collection: collection.to_owned(),
            count: ids.len(),
        });
        self.simulate_latency().await;

        if let Some(err) = lock(&self.failures).deletes.get(collection) {
            return Err(err.clone());
        }

        let mut collections = lock(&self.collections);
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let unique: HashSet<&String> = ids.iter().collect();
        Ok(unique.into_iter().filter(|id| docs.remove(*id).is_some()).count())
    }
}
