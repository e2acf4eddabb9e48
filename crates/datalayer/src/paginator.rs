//! Cursor-based pagination over one ordered collection.
//!
//! A [`Paginator`] is bound to one [`QueryShape`] for its whole life.  The
//! cursors it hands out are stamped with the paginator's identity and its
//! current epoch, so a cursor from another paginator, or from before a
//! [`Paginator::reshape`], is refused instead of silently producing a page
//! of some other query.
//!
//! `has_more` is `false` as soon as a page comes back shorter than the
//! requested size.  A collection holding an exact multiple of the page size
//! therefore ends with one extra, empty page.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, instrument};

use store::{Cursor, Document, DocumentStore, Filter, OrderBy, Query};

use crate::DataLayerError;

static NEXT_PAGINATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Collection, ordering and filters of one paginated list.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryShape {
    pub collection: String,
    pub order_by: OrderBy,
    pub filters: Vec<Filter>,
}

impl QueryShape {
    pub fn new(collection: impl Into<String>, order_by: OrderBy) -> Self {
        Self {
            collection: collection.into(),
            order_by,
            filters: Vec::new(),
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    fn base_query(&self, limit: usize) -> Query {
        Query::collection(self.collection.clone())
            .filters(self.filters.iter().cloned())
            .order_by(self.order_by.clone())
            .limit(limit)
    }
}

/// Opaque position after the last item of a fetched page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageCursor {
    owner: u64,
    epoch: u64,
    position: Cursor,
}

impl PageCursor {
    /// The underlying store cursor.
    pub fn position(&self) -> &Cursor {
        &self.position
    }
}

#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<Document>,
    pub next_cursor: Option<PageCursor>,
    pub has_more: bool,
}

impl Page {
    fn exhausted() -> Self {
        Self::default()
    }
}

pub struct Paginator {
    id: u64,
    epoch: u64,
    store: Arc<dyn DocumentStore>,
    shape: QueryShape,
    page_size: usize,
    cursor: Option<PageCursor>,
    has_more: bool,
    pages_loaded: usize,
}

impl Paginator {
    /// `page_size` is clamped to at least 1.
    pub fn new(store: Arc<dyn DocumentStore>, shape: QueryShape, page_size: usize) -> Self {
        Self {
            id: NEXT_PAGINATOR_ID.fetch_add(1, Ordering::Relaxed),
            epoch: 0,
            store,
            shape,
            page_size: page_size.max(1),
            cursor: None,
            has_more: true,
            pages_loaded: 0,
        }
    }

    pub fn shape(&self) -> &QueryShape {
        &self.shape
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn pages_loaded(&self) -> usize {
        self.pages_loaded
    }

    pub fn cursor(&self) -> Option<&PageCursor> {
        self.cursor.as_ref()
    }

    /// Fetch one page of `page_size` items after `cursor` (or from the top).
    ///
    /// Does not touch the paginator's own cursor state.
    ///
    /// # Errors
    /// - [`DataLayerError::ForeignCursor`] if `cursor` was not minted by this
    ///   paginator under its current shape.
    /// - [`DataLayerError::PageFetch`] if the store query fails.
    #[instrument(skip(self, cursor), fields(collection = %self.shape.collection))]
    pub async fn fetch_page(&self, page_size: usize, cursor: Option<&PageCursor>) -> Result<Page, DataLayerError> {
        let page_size = page_size.max(1);
        let mut query = self.shape.base_query(page_size);
        if let Some(cursor) = cursor {
            if cursor.owner != self.id || cursor.epoch != self.epoch {
                return Err(DataLayerError::ForeignCursor);
            }
            query = query.start_after(cursor.position.clone());
        }

        let snapshot = self
            .store
            .query(&query)
            .await
            .map_err(|source| DataLayerError::PageFetch {
                collection: self.shape.collection.clone(),
                source,
            })?;

        let next_cursor = snapshot.last_cursor().map(|position| PageCursor {
            owner: self.id,
            epoch: self.epoch,
            position,
        });
        let has_more = snapshot.len() >= page_size;
        debug!(returned = snapshot.len(), has_more, "page fetched");

        Ok(Page {
            items: snapshot.documents,
            next_cursor,
            has_more,
        })
    }

    /// Fetch the page after the last one loaded.
    ///
    /// Once the collection is exhausted this returns an empty page without
    /// touching the store.
    pub async fn load_next(&mut self) -> Result<Page, DataLayerError> {
        if !self.has_more {
            return Ok(Page::exhausted());
        }

        let page = self.fetch_page(self.page_size, self.cursor.as_ref()).await?;
        if let Some(cursor) = &page.next_cursor {
            self.cursor = Some(cursor.clone());
        }
        self.has_more = page.has_more;
        self.pages_loaded += 1;
        Ok(page)
    }

    /// Fetch page 1 again.  The cursor moves only when the fetch succeeds, so
    /// a failure leaves the paginator where it was.
    pub async fn restart(&mut self) -> Result<Page, DataLayerError> {
        let page = self.fetch_page(self.page_size, None).await?;
        self.cursor = page.next_cursor.clone();
        self.has_more = page.has_more;
        self.pages_loaded = 1;
        Ok(page)
    }

    /// Forget the cursor so the next `load_next` starts from page 1.
    pub fn reset(&mut self) {
        self.cursor = None;
        self.has_more = true;
        self.pages_loaded = 0;
    }

    /// Replace the filters and reset.  Cursors minted before this call are
    /// refused afterwards.
    pub fn reshape(&mut self, filters: Vec<Filter>) {
        self.shape.filters = filters;
        self.epoch += 1;
        self.reset();
    }
}
