//! Autoscale error types.

use thiserror::Error;

use lablet_capacity::CapacityError;
use lablet_core::CollaboratorError;
use lablet_state::StateError;

#[derive(Debug, Error)]
pub enum AutoscaleError {
    /// The capacity provider kept failing; surfaced to operators.
    #[error("decision {decision_id} failed after {attempts} attempts: {source}")]
    ProvisioningFailure {
        decision_id: String,
        attempts: u32,
        source: CollaboratorError,
    },

    #[error("capacity error: {0}")]
    Capacity(#[from] CapacityError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl AutoscaleError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, AutoscaleError::Capacity(e) if e.is_fatal())
    }
}

pub type AutoscaleResult<T> = Result<T, AutoscaleError>;
