//! lablet-state: durable state store for the lablet engine.
//!
//! Backed by [redb](https://docs.rs/redb). Holds everything the engine
//! needs to rebuild its in-memory capacity ledger, port free-lists,
//! instance table and reservation queue after a restart, plus the
//! append-only scaling audit trail.
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::StateStore;
