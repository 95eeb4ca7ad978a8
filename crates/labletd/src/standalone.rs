//! Collaborators for running the engine without vendor clients.
//!
//! Artifacts are read from the local filesystem. Lab orchestration and
//! compute supply are dry runs that log what they would do; the dry-run
//! provider reports its workers ready after a short simulated boot.
//! Events and assessment notices are written to the log.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use lablet_core::{
    Artifact, ArtifactStore, ArtifactUri, CapacityProvider, CollaboratorError, CollaboratorResult,
    ContentDigest, DomainEvent, EventSink, ExternalAssessment, InstanceId, LabOrchestrator,
    SystemClock, WorkerId, WorkerTemplate,
};
use lablet_engine::{Collaborators, InboundTrigger, TriggerSender};

/// Everything the daemon hands the engine.
pub fn collaborators(triggers: TriggerSender) -> Collaborators {
    Collaborators {
        artifacts: Arc::new(FileArtifacts),
        orchestrator: Arc::new(DryRunOrchestrator::default()),
        provider: Arc::new(DryRunProvider::new(triggers)),
        sink: Arc::new(LogSink),
        assessment: Arc::new(LogAssessment),
        clock: Arc::new(SystemClock),
    }
}

/// Reads `file://` and path artifacts from disk.
pub struct FileArtifacts;

#[async_trait]
impl ArtifactStore for FileArtifacts {
    async fn fetch(&self, uri: &str) -> CollaboratorResult<Artifact> {
        let parsed =
            ArtifactUri::parse(uri).map_err(|e| CollaboratorError::call("artifacts", e.to_string()))?;
        let path = match parsed {
            ArtifactUri::File { path } => path,
            other => {
                return Err(CollaboratorError::call(
                    "artifacts",
                    format!("{} artifacts are not available in standalone mode", other.scheme()),
                ));
            }
        };

        let content = tokio::fs::read_to_string(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CollaboratorError::NotFound {
                collaborator: "artifacts",
                what: path.clone(),
            },
            _ => CollaboratorError::call("artifacts", format!("read {path}: {e}")),
        })?;
        let digest = ContentDigest::of(content.as_bytes()).to_string();
        debug!(%path, %digest, "artifact read");
        Ok(Artifact { content, digest })
    }
}

#[derive(Default)]
pub struct DryRunOrchestrator {
    next_lab: AtomicU64,
}

#[async_trait]
impl LabOrchestrator for DryRunOrchestrator {
    async fn import(&self, worker_id: &str, artifact: &str) -> CollaboratorResult<String> {
        let lab_id = format!("lab-{}", self.next_lab.fetch_add(1, Ordering::Relaxed));
        info!(worker = %worker_id, lab = %lab_id, bytes = artifact.len(), "dry run: lab import");
        Ok(lab_id)
    }

    async fn start(&self, lab_id: &str) -> CollaboratorResult<()> {
        info!(lab = %lab_id, "dry run: lab start");
        Ok(())
    }

    async fn stop(&self, lab_id: &str) -> CollaboratorResult<()> {
        info!(lab = %lab_id, "dry run: lab stop");
        Ok(())
    }
}

/// Provider that pretends every call succeeds and reports the resulting
/// worker status back to the engine.
pub struct DryRunProvider {
    triggers: TriggerSender,
    boot_delay: Duration,
    next_worker: AtomicU64,
}

impl DryRunProvider {
    pub fn new(triggers: TriggerSender) -> Self {
        Self {
            triggers,
            boot_delay: Duration::from_secs(1),
            next_worker: AtomicU64::new(0),
        }
    }

    pub fn with_boot_delay(mut self, delay: Duration) -> Self {
        self.boot_delay = delay;
        self
    }

    fn report_later(&self, trigger: InboundTrigger) {
        let triggers = self.triggers.clone();
        let delay = self.boot_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if triggers.send(trigger).is_err() {
                debug!("engine gone, dropping worker status");
            }
        });
    }
}

#[async_trait]
impl CapacityProvider for DryRunProvider {
    async fn provision(&self, template: &WorkerTemplate) -> CollaboratorResult<WorkerId> {
        let n = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let worker_id = format!("{}-{n}", template.id);
        info!(template = %template.id, worker = %worker_id, "dry run: provision worker");
        self.report_later(InboundTrigger::WorkerReady {
            worker_id: worker_id.clone(),
        });
        Ok(worker_id)
    }

    async fn start(&self, worker_id: &str) -> CollaboratorResult<()> {
        info!(worker = %worker_id, "dry run: start worker");
        self.report_later(InboundTrigger::WorkerReady {
            worker_id: worker_id.to_string(),
        });
        Ok(())
    }

    async fn stop(&self, worker_id: &str) -> CollaboratorResult<()> {
        info!(worker = %worker_id, "dry run: stop worker");
        self.report_later(InboundTrigger::WorkerStopped {
            worker_id: worker_id.to_string(),
        });
        Ok(())
    }

    async fn terminate(&self, worker_id: &str) -> CollaboratorResult<()> {
        info!(worker = %worker_id, "dry run: terminate worker");
        self.report_later(InboundTrigger::WorkerTerminated {
            worker_id: worker_id.to_string(),
        });
        Ok(())
    }
}

/// Writes every domain event to the log as JSON.
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn publish(&self, event: DomainEvent) -> CollaboratorResult<()> {
        let payload = serde_json::to_string(&event)
            .map_err(|e| CollaboratorError::call("events", e.to_string()))?;
        info!(kind = event.kind(), %payload, "event");
        Ok(())
    }
}

pub struct LogAssessment;

#[async_trait]
impl ExternalAssessment for LogAssessment {
    async fn notify(
        &self,
        instance_id: &InstanceId,
        evidence: serde_json::Value,
    ) -> CollaboratorResult<()> {
        info!(instance = %instance_id, %evidence, "collection requested");
        Ok(())
    }
}
