//! `diagnostics` crate: offline audit of a collection snapshot and the
//! operator-gated cleanup that follows it.

pub mod audit;
pub mod config;
pub mod error;
pub mod reconcile;
pub mod snapshot;

pub use audit::{audit, AuditReport, BurstGroup, DaySummary, DuplicateGroup, InvalidRecord, Issue, SkippedRecord};
pub use config::{AuditConfig, AuditFields};
pub use error::DiagnosticsError;
pub use reconcile::{DeletionPlan, DeletionSummary, PlanSource, DELETE_CHUNK};
pub use snapshot::fetch_collection;
