//! Tests for `ListOrchestrator`.
//!
//! Everything runs against `MemoryStore`.  Timing-sensitive tests use a
//! store with artificial latency on a paused tokio clock, so "concurrent"
//! calls really do overlap at the store's await point.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;
use store::{Document, Field, Filter, MemoryStore, OrderBy, StoreError};

use crate::cache::ReferenceCache;
use crate::clock::ManualClock;
use crate::config::{CacheConfig, DataLayerConfig, LifecycleConfig};
use crate::lifecycle::ConsumerLifecycleRegistry;
use crate::orchestrator::{ListOrchestrator, ListSpec, ListState, LoadOutcome, Reference, SkipReason};
use crate::paginator::QueryShape;
use crate::resolver::ReferenceField;
use crate::secondary::{DependentSpec, Presence};
use crate::DataLayerError;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// `n` concerts, each pointing at venue `v{i % 3}`.  Concert 0 points at a
/// venue that does not exist.  Forms exist for concerts 0 and 1.
fn seed(store: &MemoryStore, n: usize) {
    for i in 0..n {
        let venue = if i == 0 { "gone".to_string() } else { format!("v{}", i % 3) };
        store.insert(
            "concerts",
            Document::new(
                format!("c{i:02}"),
                json!({ "date": format!("2024-03-{:02}", i + 1), "venueId": venue, "org": "o1" }),
            ),
        );
    }
    for v in 0..3 {
        store.insert("venues", Document::new(format!("v{v}"), json!({ "name": format!("Hall {v}") })));
    }
    store.insert_many(
        "forms",
        [
            Document::new("f0", json!({ "concertId": format!("c{:02}", n - 1), "status": "pending", "org": "o1" })),
            Document::new("f1", json!({ "concertId": format!("c{:02}", n - 2), "status": "validated", "org": "o1" })),
        ],
    );
}

fn spec(page_size: usize) -> ListSpec {
    ListSpec::new(QueryShape::new("concerts", OrderBy::desc("date")), page_size)
        .reference(ReferenceField::new("venueId", "venues"))
        .dependent(
            DependentSpec::new("forms", "concertId")
                .scoped(Filter::eq(Field::named("org"), "o1"))
                .flag_when("status", ["pending"]),
        )
}

struct Fixture {
    store: Arc<MemoryStore>,
    clock: ManualClock,
    list: ListOrchestrator,
}

fn fixture_with(store: MemoryStore, items: usize, page_size: usize) -> Fixture {
    let store = Arc::new(store);
    seed(&store, items);
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap());
    let cache = Arc::new(ReferenceCache::new(CacheConfig::default(), Arc::new(clock.clone())));
    let list = ListOrchestrator::new(
        store.clone(),
        cache,
        spec(page_size),
        &DataLayerConfig::default(),
        Arc::new(clock.clone()),
    );
    Fixture { store, clock, list }
}

fn fixture(items: usize, page_size: usize) -> Fixture {
    fixture_with(MemoryStore::new(), items, page_size)
}

fn loaded_len(outcome: &LoadOutcome) -> usize {
    outcome.page().map_or(0, |p| p.items.len())
}

// ============================================================
// Paging and state transitions
// ============================================================

#[tokio::test]
async fn pages_accumulate_until_exhausted() {
    let fx = fixture(25, 10);
    assert_eq!(fx.list.state(), ListState::Idle);

    let first = fx.list.refresh().await.unwrap();
    assert_eq!(loaded_len(&first), 10);
    assert_eq!(fx.list.state(), ListState::Ready { page: 1 });

    let second = fx.list.load_more().await.unwrap();
    assert_eq!(second.page().unwrap().page_number, 2);
    let third = fx.list.load_more().await.unwrap();
    assert_eq!(loaded_len(&third), 5);
    assert_eq!(fx.list.state(), ListState::Exhausted { pages: 3 });
    assert!(!fx.list.has_more());

    let after = fx.list.load_more().await.unwrap();
    assert_eq!(after.skip_reason(), Some(&SkipReason::Exhausted));

    let snapshot = fx.list.snapshot();
    assert_eq!(snapshot.items.len(), 25);
    assert_eq!(snapshot.items[0].document.id, "c24");
    assert_eq!(snapshot.items[24].document.id, "c00");
    assert_eq!(fx.store.query_count("concerts"), 3);
}

#[tokio::test]
async fn load_more_before_first_page_is_skipped() {
    let fx = fixture(5, 10);
    let outcome = fx.list.load_more().await.unwrap();
    assert_eq!(outcome.skip_reason(), Some(&SkipReason::NotStarted));
    assert_eq!(fx.store.query_count("concerts"), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_load_more_issues_one_fetch() {
    let fx = fixture_with(MemoryStore::new().with_latency(Duration::from_millis(50)), 25, 10);
    fx.list.refresh().await.unwrap();
    fx.store.reset_calls();

    let (a, b) = tokio::join!(fx.list.load_more(), fx.list.load_more());
    let (a, b) = (a.unwrap(), b.unwrap());

    let loaded = [&a, &b].iter().filter(|o| o.page().is_some()).count();
    assert_eq!(loaded, 1);
    assert!([&a, &b]
        .iter()
        .any(|o| o.skip_reason() == Some(&SkipReason::InFlight)));
    assert_eq!(fx.store.query_count("concerts"), 1);
    assert_eq!(fx.list.snapshot().items.len(), 20);
    assert!(!fx.list.is_loading());
}

#[tokio::test(start_paused = true)]
async fn refresh_during_load_more_is_skipped() {
    let fx = fixture_with(MemoryStore::new().with_latency(Duration::from_millis(50)), 25, 10);
    fx.list.refresh().await.unwrap();
    fx.clock.advance(Duration::from_secs(60));

    let (more, again) = tokio::join!(fx.list.load_more(), fx.list.refresh());
    assert!(more.unwrap().page().is_some());
    assert_eq!(again.unwrap().skip_reason(), Some(&SkipReason::InFlight));
}

#[tokio::test]
async fn refresh_honours_cooldown_but_load_more_does_not() {
    let fx = fixture(25, 10);
    fx.list.refresh().await.unwrap();

    fx.clock.advance(Duration::from_secs(4));
    let skipped = fx.list.refresh().await.unwrap();
    assert_eq!(
        skipped.skip_reason(),
        Some(&SkipReason::Cooldown {
            remaining: Duration::from_secs(6)
        })
    );

    let more = fx.list.load_more().await.unwrap();
    assert!(more.page().is_some());

    fx.clock.advance(Duration::from_secs(6));
    let reloaded = fx.list.refresh().await.unwrap();
    assert_eq!(loaded_len(&reloaded), 10);
    // A full reload replaces the accumulated items.
    assert_eq!(fx.list.snapshot().items.len(), 10);
    assert_eq!(fx.list.state(), ListState::Ready { page: 1 });
}

// ============================================================
// Failures
// ============================================================

#[tokio::test]
async fn failed_first_page_can_be_retried_immediately() {
    let fx = fixture(5, 10);
    fx.store
        .fail_queries("concerts", StoreError::Unavailable("offline".into()));

    let err = fx.list.refresh().await.unwrap_err();
    assert!(matches!(err, DataLayerError::PageFetch { .. }));
    assert!(matches!(fx.list.state(), ListState::Failed { page: 1, .. }));
    assert!(!fx.list.is_loading());

    fx.store.clear_failures();
    let retried = fx.list.refresh().await.unwrap();
    assert_eq!(loaded_len(&retried), 5);
    assert_eq!(fx.list.state(), ListState::Exhausted { pages: 1 });
}

#[tokio::test]
async fn failed_load_more_keeps_loaded_pages() {
    let fx = fixture(25, 10);
    fx.list.refresh().await.unwrap();
    fx.store
        .fail_queries("concerts", StoreError::Internal("boom".into()));

    assert!(fx.list.load_more().await.is_err());
    assert!(matches!(fx.list.state(), ListState::Failed { page: 2, .. }));
    assert_eq!(fx.list.snapshot().items.len(), 10);

    fx.store.clear_failures();
    let page = fx.list.load_more().await.unwrap();
    assert_eq!(page.page().unwrap().page_number, 2);
    assert_eq!(fx.list.snapshot().items.len(), 20);
}

#[tokio::test]
async fn failed_refresh_keeps_pages_and_load_more_continues() {
    let fx = fixture(25, 10);
    fx.list.refresh().await.unwrap();
    fx.list.load_more().await.unwrap();

    fx.clock.advance(Duration::from_secs(60));
    fx.store
        .fail_queries("concerts", StoreError::Unavailable("offline".into()));
    assert!(fx.list.refresh().await.is_err());
    assert!(matches!(fx.list.state(), ListState::Failed { page: 1, .. }));
    assert_eq!(fx.list.snapshot().items.len(), 20);

    fx.store.clear_failures();
    let next = fx.list.load_more().await.unwrap();
    assert_eq!(next.page().unwrap().page_number, 3);
    assert_eq!(loaded_len(&next), 5);

    let snapshot = fx.list.snapshot();
    let mut ids: Vec<_> = snapshot.items.iter().map(|e| e.document.id.clone()).collect();
    assert_eq!(ids.len(), 25);
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 25);
    assert_eq!(fx.list.state(), ListState::Exhausted { pages: 3 });
}

// ============================================================
// Enrichment
// ============================================================

#[tokio::test]
async fn references_are_hydrated_or_marked_missing() {
    let fx = fixture(5, 10);
    fx.list.refresh().await.unwrap();
    let items = fx.list.snapshot().items;

    let c01 = items.iter().find(|e| e.document.id == "c01").unwrap();
    let venue = c01.references["venueId"].document().unwrap();
    assert_eq!(venue.id, "v1");

    let c00 = items.iter().find(|e| e.document.id == "c00").unwrap();
    assert_eq!(c00.references["venueId"], Reference::Missing("gone".into()));

    // gone, v0, v1, v2: one batch.
    assert_eq!(fx.store.in_query_count("venues"), 1);
}

#[tokio::test]
async fn dependent_index_covers_loaded_pages() {
    let fx = fixture(25, 10);
    fx.list.refresh().await.unwrap();
    fx.list.load_more().await.unwrap();

    let snapshot = fx.list.snapshot();
    assert_eq!(snapshot.index.presence("forms", "c24"), Presence::Present);
    assert_eq!(snapshot.index.is_flagged("forms", "c24"), Some(true));
    assert_eq!(snapshot.index.is_flagged("forms", "c23"), Some(false));
    assert_eq!(snapshot.index.presence("forms", "c10"), Presence::Absent);
    // Page 3 was never loaded.
    assert_eq!(snapshot.index.presence("forms", "c02"), Presence::Unknown);
    assert!(!snapshot.index.is_degraded());
}

#[tokio::test]
async fn dependent_failure_degrades_instead_of_failing() {
    let fx = fixture(5, 10);
    fx.store
        .fail_queries("forms", StoreError::PermissionDenied("rules".into()));

    let outcome = fx.list.refresh().await.unwrap();
    let page = outcome.page().unwrap();
    assert_eq!(page.items.len(), 5);
    assert!(page.index.is_degraded());
    assert_eq!(page.index.presence("forms", "c04"), Presence::Unknown);
    assert_eq!(fx.list.state(), ListState::Exhausted { pages: 1 });
}

// ============================================================
// Invalidation
// ============================================================

#[tokio::test(start_paused = true)]
async fn results_after_invalidate_are_dropped() {
    let fx = fixture_with(MemoryStore::new().with_latency(Duration::from_millis(50)), 5, 10);

    let (outcome, ()) = tokio::join!(fx.list.refresh(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        fx.list.invalidate();
    });

    assert_eq!(outcome.unwrap().skip_reason(), Some(&SkipReason::Superseded));
    assert_eq!(fx.list.state(), ListState::Idle);
    assert!(fx.list.snapshot().items.is_empty());
    assert!(!fx.list.is_loading());

    let after = fx.list.load_more().await.unwrap();
    assert_eq!(after.skip_reason(), Some(&SkipReason::NotStarted));
}

#[tokio::test]
async fn invalidate_clears_the_refresh_cooldown() {
    let fx = fixture(25, 10);
    fx.list.refresh().await.unwrap();
    fx.list.invalidate();

    let reloaded = fx.list.refresh().await.unwrap();
    assert_eq!(loaded_len(&reloaded), 10);
    assert_eq!(fx.list.state(), ListState::Ready { page: 1 });
}

// ============================================================
// Consumer registry
// ============================================================

#[tokio::test]
async fn orchestrator_registers_reports_and_unregisters() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap());
    let registry = Arc::new(ConsumerLifecycleRegistry::new(
        LifecycleConfig::default(),
        Arc::new(clock.clone()),
    ));
    let fx = fixture(25, 10);
    let list = ListOrchestrator::new(
        fx.store.clone(),
        Arc::new(ReferenceCache::new(CacheConfig::default(), Arc::new(clock.clone()))),
        spec(10),
        &DataLayerConfig::default(),
        Arc::new(clock.clone()),
    )
    .with_registry(registry.clone());

    let id = list.instance_id().unwrap().to_owned();
    assert!(id.starts_with("concerts-1-"));
    assert_eq!(registry.len(), 1);

    list.refresh().await.unwrap();
    list.load_more().await.unwrap();
    let record = registry.get(&id).unwrap();
    assert_eq!(record.metadata["collection"], json!("concerts"));
    assert_eq!(record.metadata["pages"], json!(2));
    assert_eq!(record.metadata["items"], json!(20));

    drop(list);
    assert!(registry.is_empty());
}
