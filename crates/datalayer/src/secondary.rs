//! Dependent-collection presence and status indexes.
//!
//! Given the primary ids of a loaded page, each dependent collection is
//! queried with `foreign_key in (ids)` (chunked to the batch ceiling).  The
//! result answers "does primary X have at least one dependent record?",
//! "which dependent record is the most relevant for X?" and, when a flag
//! rule is configured, "does X have a flagged dependent record?".
//!
//! A dependent collection whose query fails does not fail the page: its
//! answers for the affected ids are [`Presence::Unknown`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, instrument};

use store::{Document, DocumentStore, Filter, Query, StoreError};

use crate::tolerant::run_tolerant;

// ---------------------------------------------------------------------------
// DependentSpec
// ---------------------------------------------------------------------------

/// A dependent record is "flagged" when `field` holds one of `values`.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagRule {
    pub field: String,
    pub values: Vec<Value>,
}

/// How to index one dependent collection.
#[derive(Debug, Clone, PartialEq)]
pub struct DependentSpec {
    pub collection: String,
    /// Field on the dependent record holding the primary id.
    pub foreign_key: String,
    /// Extra equality filters, e.g. scoping to an organization.
    pub scope: Vec<Filter>,
    /// Keep the most relevant record per primary id.
    pub track_latest: bool,
    pub flag: Option<FlagRule>,
}

impl DependentSpec {
    pub fn new(collection: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            foreign_key: foreign_key.into(),
            scope: Vec::new(),
            track_latest: false,
            flag: None,
        }
    }

    pub fn scoped(mut self, filter: Filter) -> Self {
        self.scope.push(filter);
        self
    }

    pub fn tracking_latest(mut self) -> Self {
        self.track_latest = true;
        self
    }

    pub fn flag_when<V: Into<Value>>(mut self, field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        self.flag = Some(FlagRule {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }
}

impl fmt::Display for DependentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.collection, self.foreign_key)
    }
}

// ---------------------------------------------------------------------------
// Index types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Present,
    Absent,
    /// The dependent query failed or never covered this id.
    Unknown,
}

/// What is known about one dependent collection.
#[derive(Debug, Clone, Default)]
pub struct DependentIndex {
    /// Primary ids this index can answer for.
    covered: HashSet<String>,
    present: HashSet<String>,
    latest: HashMap<String, Document>,
    flagged: HashSet<String>,
    /// Reasons the collection (or part of it) could not be loaded.
    failures: Vec<String>,
}

impl DependentIndex {
    pub fn presence(&self, primary_id: &str) -> Presence {
        if !self.covered.contains(primary_id) {
            Presence::Unknown
        } else if self.present.contains(primary_id) {
            Presence::Present
        } else {
            Presence::Absent
        }
    }

    pub fn latest(&self, primary_id: &str) -> Option<&Document> {
        self.latest.get(primary_id)
    }

    /// `None` when presence is unknown for this id.
    pub fn is_flagged(&self, primary_id: &str) -> Option<bool> {
        self.covered
            .contains(primary_id)
            .then(|| self.flagged.contains(primary_id))
    }

    pub fn present_ids(&self) -> &HashSet<String> {
        &self.present
    }

    pub fn flagged_ids(&self) -> &HashSet<String> {
        &self.flagged
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    fn add(&mut self, spec: &DependentSpec, doc: Document) {
        let Some(primary_id) = doc.str_field(&spec.foreign_key).map(str::to_owned) else {
            return;
        };
        self.present.insert(primary_id.clone());

        if let Some(rule) = &spec.flag {
            if doc.get(&rule.field).is_some_and(|v| rule.values.contains(v)) {
                self.flagged.insert(primary_id.clone());
            }
        }

        if spec.track_latest {
            let replace = self
                .latest
                .get(&primary_id)
                .map_or(true, |current| relevance(&doc) >= relevance(current));
            if replace {
                self.latest.insert(primary_id, doc);
            }
        }
    }

    fn merge(&mut self, other: DependentIndex) {
        self.covered.extend(other.covered);
        self.present.extend(other.present);
        self.flagged.extend(other.flagged);
        for (id, doc) in other.latest {
            let replace = self
                .latest
                .get(&id)
                .map_or(true, |current| relevance(&doc) >= relevance(current));
            if replace {
                self.latest.insert(id, doc);
            }
        }
        self.failures.extend(other.failures);
    }
}

/// Ordering key for "most relevant": latest update, then latest creation.
/// Unparseable or missing timestamps sort first.
fn relevance(doc: &Document) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let read = |field: &str| doc.timestamp(field).and_then(Result::ok);
    (read("updatedAt"), read("createdAt"))
}

/// Indexes for every dependent collection of a page (or of several merged
/// pages).
#[derive(Debug, Clone, Default)]
pub struct SecondaryIndex {
    by_collection: HashMap<String, DependentIndex>,
}

impl SecondaryIndex {
    pub fn presence(&self, collection: &str, primary_id: &str) -> Presence {
        self.by_collection
            .get(collection)
            .map_or(Presence::Unknown, |index| index.presence(primary_id))
    }

    pub fn latest(&self, collection: &str, primary_id: &str) -> Option<&Document> {
        self.by_collection
            .get(collection)
            .and_then(|index| index.latest(primary_id))
    }

    pub fn is_flagged(&self, collection: &str, primary_id: &str) -> Option<bool> {
        self.by_collection
            .get(collection)
            .and_then(|index| index.is_flagged(primary_id))
    }

    pub fn collection(&self, collection: &str) -> Option<&DependentIndex> {
        self.by_collection.get(collection)
    }

    /// Whether any dependent collection failed to load.
    pub fn is_degraded(&self) -> bool {
        self.by_collection.values().any(|i| !i.failures.is_empty())
    }

    pub fn merge(&mut self, other: SecondaryIndex) {
        for (collection, index) in other.by_collection {
            self.by_collection.entry(collection).or_default().merge(index);
        }
    }
}

// ---------------------------------------------------------------------------
// SecondaryIndexLoader
// ---------------------------------------------------------------------------

pub struct SecondaryIndexLoader {
    store: Arc<dyn DocumentStore>,
    batch_ceiling: usize,
}

impl SecondaryIndexLoader {
    /// `batch_ceiling` is clamped to at least 1.
    pub fn new(store: Arc<dyn DocumentStore>, batch_ceiling: usize) -> Self {
        Self {
            store,
            batch_ceiling: batch_ceiling.max(1),
        }
    }

    /// Build indexes for `primary_ids` over every spec.
    ///
    /// Never fails: a dependent whose queries fail yields an index that answers
    /// [`Presence::Unknown`] for every id and records the failure reason.
    #[instrument(skip_all, fields(primary = primary_ids.len(), dependents = specs.len()))]
    pub async fn load(&self, primary_ids: &[String], specs: &[DependentSpec]) -> SecondaryIndex {
        let mut index = SecondaryIndex::default();
        if primary_ids.is_empty() {
            for spec in specs {
                index.by_collection.entry(spec.collection.clone()).or_default();
            }
            return index;
        }

        let outcome = run_tolerant("secondary index", specs.iter(), |spec| async move {
            self.load_one(spec, primary_ids).await
        })
        .await;

        for (spec, dependent) in outcome.succeeded {
            index
                .by_collection
                .entry(spec.collection.clone())
                .or_default()
                .merge(dependent);
        }
        for (spec, err) in outcome.failed {
            let failed = DependentIndex {
                failures: vec![err.to_string()],
                ..DependentIndex::default()
            };
            index
                .by_collection
                .entry(spec.collection.clone())
                .or_default()
                .merge(failed);
        }
        index
    }

    async fn load_one(&self, spec: &DependentSpec, primary_ids: &[String]) -> Result<DependentIndex, StoreError> {
        let mut dependent = DependentIndex::default();
        let mut fetched = 0usize;
        for chunk in primary_ids.chunks(self.batch_ceiling) {
            let query = Query::collection(spec.collection.clone())
                .filters(spec.scope.iter().cloned())
                .filter(Filter::field_in(spec.foreign_key.clone(), chunk.iter().cloned()));
            let snapshot = self.store.query(&query).await?;
            fetched += snapshot.len();
            for doc in snapshot.documents {
                dependent.add(spec, doc);
            }
        }
        dependent.covered.extend(primary_ids.iter().cloned());
        debug!(
            collection = %spec.collection,
            fetched,
            present = dependent.present.len(),
            "dependent collection indexed"
        );
        Ok(dependent)
    }
}
