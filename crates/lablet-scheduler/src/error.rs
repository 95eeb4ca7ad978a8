//! Scheduler error types.

use thiserror::Error;

use lablet_capacity::CapacityError;
use lablet_core::ReservationId;
use lablet_lifecycle::LifecycleError;
use lablet_state::StateError;

use crate::scheduler::UnmetDemand;

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No worker can take the reservation now; it waits in the queue.
    #[error("reservation {} queued: {}", .0.reservation_id, .0.shortfall)]
    Queued(Box<UnmetDemand>),

    /// The reservation can never be satisfied as submitted.
    #[error("reservation {reservation_id} rejected: {reason}")]
    Rejected {
        reservation_id: ReservationId,
        reason: String,
    },

    #[error("unknown reservation: {0}")]
    UnknownReservation(ReservationId),

    #[error("capacity error: {0}")]
    Capacity(#[from] CapacityError),

    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl SchedulerError {
    pub fn is_fatal(&self) -> bool {
        match self {
            SchedulerError::Capacity(e) => e.is_fatal(),
            SchedulerError::Lifecycle(e) => e.is_fatal(),
            _ => false,
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
