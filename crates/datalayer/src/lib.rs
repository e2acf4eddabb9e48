//! `datalayer` crate: pagination, reference resolution, caching and list
//! orchestration on top of a [`store::DocumentStore`].

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod orchestrator;
pub mod paginator;
pub mod resolver;
pub mod secondary;
pub mod tolerant;

pub use cache::{CacheKey, CacheStats, ReferenceCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, DataLayerConfig, HealthPenalties, LifecycleConfig};
pub use error::DataLayerError;
pub use lifecycle::{ConsumerLifecycleRegistry, HealthReport, HealthStatus, Hotspot, RegistryStats, Severity};
pub use orchestrator::{
    EnrichedEntity, EnrichedPage, ListOrchestrator, ListSnapshot, ListSpec, ListState, LoadOutcome, Reference,
    SkipReason,
};
pub use paginator::{Page, PageCursor, Paginator, QueryShape};
pub use resolver::{BatchReferenceResolver, ReferenceField, ReferenceSet, ResolvedReferences};
pub use secondary::{DependentIndex, DependentSpec, Presence, SecondaryIndex, SecondaryIndexLoader};
pub use tolerant::{collect_tolerant, run_tolerant, TolerantOutcome};

#[cfg(test)]
mod orchestrator_tests;
