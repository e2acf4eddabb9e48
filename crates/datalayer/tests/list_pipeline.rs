//! End-to-end list pipeline over the public API: a concert list with venue
//! and artist references, form and contract dependents, a shared reference
//! cache and a consumer registry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;

use datalayer::{
    CacheConfig, ConsumerLifecycleRegistry, DataLayerConfig, DependentSpec, HealthStatus, LifecycleConfig,
    ListOrchestrator, ListSpec, ManualClock, Presence, QueryShape, ReferenceCache, ReferenceField,
};
use store::{Document, MemoryStore, OrderBy};

fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for i in 0..12 {
        store.insert(
            "concerts",
            Document::new(
                format!("c{i:02}"),
                json!({
                    "date": { "seconds": 1_709_251_200 + i * 86_400, "nanoseconds": 0 },
                    "venueId": format!("v{}", i % 4),
                    "artistId": "a1",
                }),
            ),
        );
    }
    for v in 0..4 {
        store.insert("venues", Document::new(format!("v{v}"), json!({ "name": format!("Venue {v}") })));
    }
    store.insert("artists", Document::new("a1", json!({ "name": "The Lanterns" })));
    store.insert_many(
        "contracts",
        [
            Document::new("k1", json!({ "concertId": "c11", "status": "draft", "updatedAt": "2024-02-01T10:00:00Z" })),
            Document::new("k2", json!({ "concertId": "c11", "status": "signed", "updatedAt": "2024-02-03T10:00:00Z" })),
            Document::new("k3", json!({ "concertId": "c10", "status": "draft", "createdAt": 1_706_000_000_000i64 })),
        ],
    );
    store
}

fn concert_list() -> ListSpec {
    ListSpec::new(QueryShape::new("concerts", OrderBy::desc("date")), 5)
        .reference(ReferenceField::new("venueId", "venues"))
        .reference(ReferenceField::new("artistId", "artists"))
        .dependent(DependentSpec::new("forms", "concertId"))
        .dependent(DependentSpec::new("contracts", "concertId").tracking_latest())
}

#[tokio::test]
async fn concert_list_loads_enriches_and_shares_the_cache() {
    let store = seeded_store();
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap());
    let cache = Arc::new(ReferenceCache::new(CacheConfig::default(), Arc::new(clock.clone())));
    let registry = Arc::new(ConsumerLifecycleRegistry::new(
        LifecycleConfig::default(),
        Arc::new(clock.clone()),
    ));
    let config = DataLayerConfig::default();

    let list = ListOrchestrator::new(store.clone(), cache.clone(), concert_list(), &config, Arc::new(clock.clone()))
        .with_registry(registry.clone());

    list.refresh().await.unwrap();
    while list.has_more() {
        list.load_more().await.unwrap();
    }

    let snapshot = list.snapshot();
    assert_eq!(snapshot.items.len(), 12);
    assert_eq!(snapshot.items[0].document.id, "c11");
    assert!(snapshot
        .items
        .iter()
        .all(|e| e.references.values().all(|r| r.document().is_some())));

    // Each venue and the artist were fetched once, then served from cache.
    assert_eq!(store.in_query_count("venues"), 1);
    assert_eq!(store.in_query_count("artists"), 1);
    assert!(cache.stats().hits > 0);

    let contract = snapshot.index.latest("contracts", "c11").unwrap();
    assert_eq!(contract.id, "k2");
    assert_eq!(snapshot.index.latest("contracts", "c10").unwrap().id, "k3");
    assert_eq!(snapshot.index.presence("contracts", "c00"), Presence::Absent);
    assert_eq!(snapshot.index.presence("forms", "c05"), Presence::Absent);

    // A second list over the same cache does not hit the store for
    // references while the TTL holds.
    let other = ListOrchestrator::new(store.clone(), cache.clone(), concert_list(), &config, Arc::new(clock.clone()))
        .with_registry(registry.clone());
    store.reset_calls();
    other.refresh().await.unwrap();
    assert_eq!(store.query_count("venues"), 0);
    assert_eq!(store.query_count("artists"), 0);

    let report = registry.get_health_report();
    assert_eq!(report.stats.total, 2);
    assert_eq!(report.status, HealthStatus::Excellent);

    drop(other);
    drop(list);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn expired_references_are_fetched_again() {
    let store = seeded_store();
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap());
    let cache = Arc::new(ReferenceCache::new(
        CacheConfig::default().with_ttl("venues", Duration::from_secs(30)),
        Arc::new(clock.clone()),
    ));
    let list = ListOrchestrator::new(
        store.clone(),
        cache,
        concert_list(),
        &DataLayerConfig::default(),
        Arc::new(clock.clone()),
    );

    list.refresh().await.unwrap();
    clock.advance(Duration::from_secs(31));
    store.reset_calls();
    list.refresh().await.unwrap();

    assert_eq!(store.in_query_count("venues"), 1);
    assert_eq!(store.in_query_count("artists"), 0);
}
