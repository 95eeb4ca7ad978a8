//! Lifecycle error types.

use lablet_capacity::CapacityError;
use lablet_core::{InstanceId, InstanceState, WorkerId};
use lablet_state::StateError;
use thiserror::Error;

use crate::transitions::Trigger;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("unknown instance: {0}")]
    UnknownInstance(InstanceId),

    #[error("instance already exists: {0}")]
    InstanceExists(InstanceId),

    #[error("invalid transition for {instance_id}: {trigger} from {from}")]
    InvalidTransition {
        instance_id: InstanceId,
        from: InstanceState,
        trigger: Trigger,
    },

    #[error("{trigger} cannot be fired directly on {instance_id}")]
    UnsupportedTrigger {
        instance_id: InstanceId,
        trigger: Trigger,
    },

    #[error("instance {instance_id} cannot restart after its timeslot ended")]
    OutsideTimeslot { instance_id: InstanceId },

    #[error("fatal: instance {instance_id} is already bound to {worker_id}")]
    AlreadyBound {
        instance_id: InstanceId,
        worker_id: WorkerId,
    },

    #[error("capacity error: {0}")]
    Capacity(#[from] CapacityError),

    #[error("state error: {0}")]
    State(#[from] StateError),
}

impl LifecycleError {
    pub fn is_fatal(&self) -> bool {
        match self {
            LifecycleError::AlreadyBound { .. } => true,
            LifecycleError::Capacity(e) => e.is_fatal(),
            _ => false,
        }
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
