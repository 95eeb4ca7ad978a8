//! Engine error types.

use thiserror::Error;

use lablet_autoscale::AutoscaleError;
use lablet_capacity::CapacityError;
use lablet_core::{CollaboratorError, ConfigError, InstanceId};
use lablet_lifecycle::{LifecycleError, Trigger};
use lablet_scheduler::SchedulerError;
use lablet_state::StateError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// An existing `(id, version)` was registered again with different content.
    #[error("definition {definition} already registered with different content")]
    DefinitionConflict { definition: String },

    #[error("invalid definition {definition}: {reason}")]
    InvalidDefinition { definition: String, reason: String },

    #[error("artifact for {definition} changed: expected {expected}, fetched {actual}")]
    DigestMismatch {
        definition: String,
        expected: String,
        actual: String,
    },

    #[error("unknown definition: {0}")]
    UnknownDefinition(String),

    #[error("unknown worker template: {0}")]
    UnknownTemplate(String),

    /// Internal and payload-carrying triggers do not come from outside.
    #[error("{trigger} is not accepted from outside the engine (instance {instance_id})")]
    RejectedTrigger {
        instance_id: InstanceId,
        trigger: Trigger,
    },

    #[error("instance {0} is past scheduling but has no worker")]
    Unbound(InstanceId),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("capacity error: {0}")]
    Capacity(#[from] CapacityError),

    #[error("autoscale error: {0}")]
    Autoscale(#[from] AutoscaleError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl EngineError {
    /// A broken invariant. The engine stops rather than carry on.
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::Unbound(_) => true,
            EngineError::Scheduler(e) => e.is_fatal(),
            EngineError::Lifecycle(e) => e.is_fatal(),
            EngineError::Capacity(e) => e.is_fatal(),
            EngineError::Autoscale(e) => e.is_fatal(),
            _ => false,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
