//! Seams to the engine's external collaborators.
//!
//! The engine never talks to a vendor API, a database driver, or an event
//! bus directly. It calls these traits, and long-running calls are issued
//! outside every engine lock.

use async_trait::async_trait;
use thiserror::Error;

use crate::events::DomainEvent;
use crate::types::{InstanceId, WorkerId, WorkerTemplate};

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("{collaborator}: {message}")]
    Call {
        collaborator: &'static str,
        message: String,
    },

    #[error("{collaborator}: not found: {what}")]
    NotFound {
        collaborator: &'static str,
        what: String,
    },
}

impl CollaboratorError {
    pub fn call(collaborator: &'static str, message: impl Into<String>) -> Self {
        CollaboratorError::Call {
            collaborator,
            message: message.into(),
        }
    }
}

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// Artifact content plus its digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub content: String,
    pub digest: String,
}

/// Definition artifact retrieval.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn fetch(&self, uri: &str) -> CollaboratorResult<Artifact>;
}

/// Vendor lab orchestration on a worker.
#[async_trait]
pub trait LabOrchestrator: Send + Sync {
    /// Import a rewritten artifact onto a worker; returns the lab id.
    async fn import(&self, worker_id: &str, artifact: &str) -> CollaboratorResult<String>;
    async fn start(&self, lab_id: &str) -> CollaboratorResult<()>;
    async fn stop(&self, lab_id: &str) -> CollaboratorResult<()>;
}

/// Compute supply.
#[async_trait]
pub trait CapacityProvider: Send + Sync {
    /// Request a new worker built from `template`; returns its id.
    async fn provision(&self, template: &WorkerTemplate) -> CollaboratorResult<WorkerId>;
    /// Restart a stopped worker.
    async fn start(&self, worker_id: &str) -> CollaboratorResult<()>;
    async fn stop(&self, worker_id: &str) -> CollaboratorResult<()>;
    async fn terminate(&self, worker_id: &str) -> CollaboratorResult<()>;
}

/// Outbound domain events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: DomainEvent) -> CollaboratorResult<()>;
}

/// External collection/grading system.
///
/// Its completions come back to the engine as inbound triggers.
#[async_trait]
pub trait ExternalAssessment: Send + Sync {
    async fn notify(
        &self,
        instance_id: &InstanceId,
        evidence: serde_json::Value,
    ) -> CollaboratorResult<()>;
}
