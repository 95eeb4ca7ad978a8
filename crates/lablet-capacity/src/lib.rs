//! lablet-capacity: the engine's mutable shared state.
//!
//! # Components
//!
//! - **`CapacityLedger`**: declared vs. allocated capacity per worker;
//!   `reserve` debits atomically and hands back a [`Lease`](lablet_core::Lease)
//! - **`PortAllocator`**: per-worker port free-lists, lowest ports first
//! - **`WorkerFleet`**: registry of workers and their status
//! - **`template`**: positional port naming and `${port:<name>}` rewriting
//!
//! Ledger and allocator lock per worker, so commits against different
//! workers never contend. Fatal invariant violations are reported as
//! [`CapacityError`] variants whose [`is_fatal`](CapacityError::is_fatal)
//! answers `true`.

pub mod error;
pub mod fleet;
pub mod ledger;
pub mod ports;
pub mod template;

pub use error::{CapacityError, CapacityResult};
pub use fleet::WorkerFleet;
pub use ledger::{CapacityLedger, CapacitySnapshot};
pub use ports::{PortAllocator, PortSnapshot};
pub use template::{rewrite_artifact, rewrite_template};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
