//! Capacity error types.

use lablet_core::{Capacity, LeaseId, WorkerId, WorkerStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CapacityError {
    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error("worker already registered: {0}")]
    WorkerExists(WorkerId),

    #[error("insufficient capacity on {worker_id}: requested {requested}, available {available}")]
    InsufficientCapacity {
        worker_id: WorkerId,
        requested: Capacity,
        available: Capacity,
    },

    #[error("port exhaustion on {worker_id}: requested {requested}, {free} free")]
    PortExhaustion {
        worker_id: WorkerId,
        requested: u32,
        free: u32,
    },

    #[error("worker {worker_id} is {status}, not RUNNING")]
    WorkerNotRunning {
        worker_id: WorkerId,
        status: WorkerStatus,
    },

    #[error("worker {worker_id} still holds {count} allocations")]
    StillAllocated { worker_id: WorkerId, count: usize },

    #[error("port template names {names} ports but {ports} were allocated")]
    TemplateMismatch { names: usize, ports: usize },

    #[error("artifact references unknown port placeholder: {0}")]
    UnknownPlaceholder(String),

    #[error("invalid placeholder pattern: {0}")]
    Pattern(#[from] regex::Error),

    // ── Invariant violations ──────────────────────────────────────

    #[error("fatal: {lease} on {worker_id} released twice or never issued")]
    DoubleRelease { worker_id: WorkerId, lease: LeaseId },

    #[error("fatal: {lease} on {worker_id} restored twice")]
    DuplicateLease { worker_id: WorkerId, lease: LeaseId },

    #[error("fatal: {lease} would push {worker_id} past its declared capacity")]
    Overcommit { worker_id: WorkerId, lease: LeaseId },

    #[error("fatal: port {port} on {worker_id} is not held by {instance_id}")]
    PortNotHeld {
        worker_id: WorkerId,
        instance_id: String,
        port: u16,
    },

    #[error("fatal: port {port} on {worker_id} is already allocated")]
    PortConflict { worker_id: WorkerId, port: u16 },

    #[error("fatal: port {port} is outside the range of {worker_id}")]
    PortOutOfRange { worker_id: WorkerId, port: u16 },
}

impl CapacityError {
    /// True for errors that mean the bookkeeping itself is wrong.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CapacityError::DoubleRelease { .. }
                | CapacityError::DuplicateLease { .. }
                | CapacityError::Overcommit { .. }
                | CapacityError::PortNotHeld { .. }
                | CapacityError::PortConflict { .. }
                | CapacityError::PortOutOfRange { .. }
        )
    }
}

pub type CapacityResult<T> = Result<T, CapacityError>;
