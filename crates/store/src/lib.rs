//! `store` crate: the remote document store capability surface.
//!
//! The data layer depends on exactly this surface and no more: ordered
//! queries with cursor pagination, bounded "value in set" filters, equality
//! filters, single-document fetches and an atomic batch delete.  Concrete
//! backends implement [`DocumentStore`]; [`mock::MemoryStore`] is the
//! in-process implementation used by tests and by the CLI.

pub mod error;
pub mod mock;
pub mod models;
pub mod query;
pub mod temporal;
pub mod traits;

pub use error::StoreError;
pub use mock::MemoryStore;
pub use models::Document;
pub use query::{Cursor, Direction, Field, Filter, OrderBy, Query, Snapshot, IN_FILTER_CEILING};
pub use temporal::{Temporal, TemporalError};
pub use traits::DocumentStore;
