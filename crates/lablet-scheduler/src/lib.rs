//! lablet-scheduler: binds reservations to workers.
//!
//! # Components
//!
//! - **`queue`**: `ReservationQueue`, the ordered backlog of unplaced reservations
//! - **`executor`**: `PlacementExecutor`, the per-worker reserve + allocate commit
//! - **`scheduler`**: `SchedulingEngine`: submit, sweep and cancel
//!
//! A reservation that cannot be placed is queued, never dropped, and the
//! caller gets an [`UnmetDemand`] describing the shortfall so it can be
//! handed to the scaling controller.

pub mod error;
pub mod executor;
pub mod queue;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use executor::PlacementExecutor;
pub use queue::{QueuedReservation, ReservationQueue};
pub use scheduler::{Placement, SchedulingEngine, Shortfall, SweepReport, UnmetDemand};
