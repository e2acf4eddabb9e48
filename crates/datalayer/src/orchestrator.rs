//! List orchestration: fetch page → hydrate references → index dependents.
//!
//! One [`ListOrchestrator`] drives one list screen.  Its state moves
//! `Idle → Loading(1) → Ready(1) → Loading(2) → … → Exhausted`, with
//! `Failed` as the retryable error state of a primary page fetch.
//!
//! Ordering guarantees:
//! 1. At most one fetch is in flight per orchestrator; a `load_more` or
//!    `refresh` arriving meanwhile is skipped, not queued.
//! 2. A full reload is skipped if the previous one completed less than
//!    `refresh_cooldown` ago.  `load_more` ignores the cooldown.
//! 3. Results that complete after [`ListOrchestrator::invalidate`] (or after
//!    a newer refresh) are dropped on arrival.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};

use store::{Document, DocumentStore};

use crate::cache::ReferenceCache;
use crate::clock::{elapsed, Clock};
use crate::config::DataLayerConfig;
use crate::lifecycle::ConsumerLifecycleRegistry;
use crate::paginator::{Page, Paginator, QueryShape};
use crate::resolver::{BatchReferenceResolver, ReferenceField, ReferenceSet};
use crate::secondary::{DependentSpec, SecondaryIndex, SecondaryIndexLoader};
use crate::DataLayerError;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Everything one list screen needs to describe its data.
#[derive(Debug, Clone)]
pub struct ListSpec {
    pub shape: QueryShape,
    pub page_size: usize,
    pub references: Vec<ReferenceField>,
    pub dependents: Vec<DependentSpec>,
}

impl ListSpec {
    pub fn new(shape: QueryShape, page_size: usize) -> Self {
        Self {
            shape,
            page_size,
            references: Vec::new(),
            dependents: Vec::new(),
        }
    }

    pub fn reference(mut self, field: ReferenceField) -> Self {
        self.references.push(field);
        self
    }

    pub fn dependent(mut self, spec: DependentSpec) -> Self {
        self.dependents.push(spec);
        self
    }
}

/// A hydrated foreign key.
#[derive(Debug, Clone, PartialEq)]
pub enum Reference {
    Resolved(Document),
    /// The id did not resolve to a document (deleted, never existed, or
    /// the lookup failed).
    Missing(String),
}

impl Reference {
    pub fn document(&self) -> Option<&Document> {
        match self {
            Reference::Resolved(doc) => Some(doc),
            Reference::Missing(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedEntity {
    pub document: Document,
    /// Keyed by reference field name.  Fields absent on the document are
    /// absent here too.
    pub references: BTreeMap<String, Reference>,
}

#[derive(Debug, Clone)]
pub struct EnrichedPage {
    /// 1-based.
    pub page_number: usize,
    pub items: Vec<EnrichedEntity>,
    pub index: SecondaryIndex,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListState {
    Idle,
    Loading { page: usize },
    Ready { page: usize },
    Exhausted { pages: usize },
    Failed { page: usize, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Another fetch is still running.
    InFlight,
    /// The previous full reload finished too recently.
    Cooldown { remaining: Duration },
    /// No more pages.
    Exhausted,
    /// `load_more` before any page was loaded.
    NotStarted,
    /// The result arrived after an invalidation or a newer refresh.
    Superseded,
}

#[derive(Debug, Clone)]
pub enum LoadOutcome {
    Loaded(EnrichedPage),
    Skipped(SkipReason),
}

impl LoadOutcome {
    pub fn page(&self) -> Option<&EnrichedPage> {
        match self {
            LoadOutcome::Loaded(page) => Some(page),
            LoadOutcome::Skipped(_) => None,
        }
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        match self {
            LoadOutcome::Loaded(_) => None,
            LoadOutcome::Skipped(reason) => Some(reason),
        }
    }
}

/// Everything loaded so far, across pages.
#[derive(Debug, Clone)]
pub struct ListSnapshot {
    pub items: Vec<EnrichedEntity>,
    pub index: SecondaryIndex,
    pub state: ListState,
    pub has_more: bool,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Inner {
    state: ListState,
    items: Vec<EnrichedEntity>,
    index: SecondaryIndex,
    pages: usize,
    has_more: bool,
    last_full_reload: Option<DateTime<Utc>>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: ListState::Idle,
            items: Vec::new(),
            index: SecondaryIndex::default(),
            pages: 0,
            has_more: true,
            last_full_reload: None,
        }
    }
}

/// Clears the in-flight flag when dropped, including when the caller drops
/// the future mid-fetch.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Consumer {
    registry: Arc<ConsumerLifecycleRegistry>,
    instance_id: String,
}

// ---------------------------------------------------------------------------
// ListOrchestrator
// ---------------------------------------------------------------------------

pub struct ListOrchestrator {
    collection: String,
    references: Vec<ReferenceField>,
    dependents: Vec<DependentSpec>,
    paginator: tokio::sync::Mutex<Paginator>,
    resolver: BatchReferenceResolver,
    secondary: SecondaryIndexLoader,
    clock: Arc<dyn Clock>,
    refresh_cooldown: Duration,
    in_flight: AtomicBool,
    generation: AtomicU64,
    inner: Mutex<Inner>,
    consumer: Option<Consumer>,
}

impl ListOrchestrator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cache: Arc<ReferenceCache>,
        spec: ListSpec,
        config: &DataLayerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ceiling = config.effective_batch_ceiling();
        let collection = spec.shape.collection.clone();
        Self {
            collection,
            references: spec.references,
            dependents: spec.dependents,
            paginator: tokio::sync::Mutex::new(Paginator::new(store.clone(), spec.shape, spec.page_size)),
            resolver: BatchReferenceResolver::new(store.clone(), cache, ceiling),
            secondary: SecondaryIndexLoader::new(store, ceiling),
            clock,
            refresh_cooldown: config.refresh_cooldown,
            in_flight: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            inner: Mutex::new(Inner::default()),
            consumer: None,
        }
    }

    /// Register this orchestrator as a consumer.  It reports its progress
    /// through metadata updates and unregisters itself when dropped.
    pub fn with_registry(mut self, registry: Arc<ConsumerLifecycleRegistry>) -> Self {
        let metadata = object(json!({ "collection": self.collection }));
        let instance_id = registry.register(&self.collection, metadata);
        self.consumer = Some(Consumer { registry, instance_id });
        self
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.consumer.as_ref().map(|c| c.instance_id.as_str())
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ListState {
        self.inner().state.clone()
    }

    pub fn has_more(&self) -> bool {
        self.inner().has_more
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ListSnapshot {
        let inner = self.inner();
        ListSnapshot {
            items: inner.items.clone(),
            index: inner.index.clone(),
            state: inner.state.clone(),
            has_more: inner.has_more,
        }
    }

    /// Drop everything loaded and ignore any fetch still in flight.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        *self.inner() = Inner::default();
        debug!(collection = %self.collection, "list invalidated");
    }

    /// Reload from page 1.
    ///
    /// # Errors
    /// [`DataLayerError::PageFetch`] when the primary page query fails; the
    /// state is then `Failed { page: 1, .. }` and the call can be retried
    /// immediately.  Pages loaded before the failure are kept and
    /// `load_more` continues after them.
    #[instrument(skip(self), fields(collection = %self.collection))]
    pub async fn refresh(&self) -> Result<LoadOutcome, DataLayerError> {
        let now = self.clock.now();
        if let Some(last) = self.inner().last_full_reload {
            let since = elapsed(last, now);
            if since < self.refresh_cooldown {
                debug!(?since, "refresh skipped, cooldown active");
                return Ok(LoadOutcome::Skipped(SkipReason::Cooldown {
                    remaining: self.refresh_cooldown - since,
                }));
            }
        }

        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            return Ok(LoadOutcome::Skipped(SkipReason::InFlight));
        };
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner().state = ListState::Loading { page: 1 };

        let page = self.paginator.lock().await.restart().await;
        let page = match page {
            Ok(page) => page,
            Err(err) => return Err(self.fail(generation, 1, err)),
        };

        let enriched = self.enrich(page, 1).await;
        if self.generation.load(Ordering::Acquire) != generation {
            return Ok(LoadOutcome::Skipped(SkipReason::Superseded));
        }

        {
            let mut inner = self.inner();
            inner.items = enriched.items.clone();
            inner.index = enriched.index.clone();
            inner.pages = 1;
            inner.has_more = enriched.has_more;
            inner.state = settled_state(1, enriched.has_more);
            inner.last_full_reload = Some(self.clock.now());
        }
        self.report_progress();
        info!(items = enriched.items.len(), has_more = enriched.has_more, "first page loaded");
        Ok(LoadOutcome::Loaded(enriched))
    }

    /// Load the page after the last one loaded.
    ///
    /// # Errors
    /// [`DataLayerError::PageFetch`] when the primary page query fails; the
    /// already loaded pages are kept and the call can be retried.
    #[instrument(skip(self), fields(collection = %self.collection))]
    pub async fn load_more(&self) -> Result<LoadOutcome, DataLayerError> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            debug!("load_more skipped, fetch in flight");
            return Ok(LoadOutcome::Skipped(SkipReason::InFlight));
        };

        let page_number = {
            let mut inner = self.inner();
            if inner.pages == 0 {
                return Ok(LoadOutcome::Skipped(SkipReason::NotStarted));
            }
            if !inner.has_more {
                return Ok(LoadOutcome::Skipped(SkipReason::Exhausted));
            }
            let next = inner.pages + 1;
            inner.state = ListState::Loading { page: next };
            next
        };
        let generation = self.generation.load(Ordering::Acquire);

        let page = self.paginator.lock().await.load_next().await;
        let page = match page {
            Ok(page) => page,
            Err(err) => return Err(self.fail(generation, page_number, err)),
        };

        let enriched = self.enrich(page, page_number).await;
        if self.generation.load(Ordering::Acquire) != generation {
            return Ok(LoadOutcome::Skipped(SkipReason::Superseded));
        }

        {
            let mut inner = self.inner();
            inner.items.extend(enriched.items.iter().cloned());
            inner.index.merge(enriched.index.clone());
            inner.pages = page_number;
            inner.has_more = enriched.has_more;
            inner.state = settled_state(page_number, enriched.has_more);
        }
        self.report_progress();
        debug!(page = page_number, items = enriched.items.len(), "page appended");
        Ok(LoadOutcome::Loaded(enriched))
    }

    fn fail(&self, generation: u64, page: usize, err: DataLayerError) -> DataLayerError {
        warn!(page, error = %err, "page load failed");
        if self.generation.load(Ordering::Acquire) == generation {
            self.inner().state = ListState::Failed {
                page,
                message: err.to_string(),
            };
        }
        err
    }

    async fn enrich(&self, page: Page, page_number: usize) -> EnrichedPage {
        let references = ReferenceSet::extract(&page.items, &self.references);
        let resolved = self.resolver.resolve_all(&references).await;

        let ids: Vec<String> = page.items.iter().map(|doc| doc.id.clone()).collect();
        let index = self.secondary.load(&ids, &self.dependents).await;

        let items = page
            .items
            .into_iter()
            .map(|document| {
                let references = self
                    .references
                    .iter()
                    .filter_map(|field| {
                        let id = document.str_field(&field.field)?;
                        let reference = match resolved.lookup(&field.collection, id) {
                            Some(Some(doc)) => Reference::Resolved(doc.clone()),
                            _ => Reference::Missing(id.to_owned()),
                        };
                        Some((field.field.clone(), reference))
                    })
                    .collect();
                EnrichedEntity { document, references }
            })
            .collect();

        EnrichedPage {
            page_number,
            items,
            index,
            has_more: page.has_more,
        }
    }

    fn report_progress(&self) {
        let Some(consumer) = &self.consumer else {
            return;
        };
        let (pages, items) = {
            let inner = self.inner();
            (inner.pages, inner.items.len())
        };
        consumer
            .registry
            .update_metadata(&consumer.instance_id, object(json!({ "pages": pages, "items": items })));
    }
}

impl Drop for ListOrchestrator {
    fn drop(&mut self) {
        if let Some(consumer) = &self.consumer {
            consumer.registry.unregister(&consumer.instance_id);
        }
    }
}

fn settled_state(page: usize, has_more: bool) -> ListState {
    if has_more {
        ListState::Ready { page }
    } else {
        ListState::Exhausted { pages: page }
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
