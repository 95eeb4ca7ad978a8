//! In-memory collaborators and a harness for engine scenario tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use lablet_core::{
    Artifact, ArtifactStore, CapacityProvider, CollaboratorError, CollaboratorResult,
    ContentDigest, DefinitionRef, DomainEvent, EngineConfig, EventSink, ExternalAssessment,
    InstanceId, LabOrchestrator, LabletDefinition, LicenseType, ManualClock, PortRange,
    Reservation, ResourceRequirements, Timeslot, Worker, WorkerId, WorkerStatus, WorkerTemplate,
};
use lablet_engine::{Collaborators, LabletEngine, TriggerReceiver, trigger_channel};
use lablet_state::StateStore;

pub const NOW: u64 = 1_000_000;

pub const ARTIFACT: &str = "console: ${port:console}\nvnc: ${port:vnc}\n";

#[derive(Default)]
pub struct MemoryArtifacts {
    pub content: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl ArtifactStore for MemoryArtifacts {
    async fn fetch(&self, uri: &str) -> CollaboratorResult<Artifact> {
        let content = self
            .content
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .unwrap_or_else(|| ARTIFACT.to_string());
        let digest = ContentDigest::of(content.as_bytes()).to_string();
        Ok(Artifact { content, digest })
    }
}

#[derive(Default)]
pub struct FakeOrchestrator {
    pub imports: Mutex<Vec<(WorkerId, String)>>,
    pub starts: Mutex<Vec<String>>,
    pub stops: Mutex<Vec<String>>,
    pub fail_imports: Mutex<bool>,
    pub fail_starts: Mutex<bool>,
    next_lab: AtomicU64,
}

#[async_trait]
impl LabOrchestrator for FakeOrchestrator {
    async fn import(&self, worker_id: &str, artifact: &str) -> CollaboratorResult<String> {
        if *self.fail_imports.lock().unwrap() {
            return Err(CollaboratorError::call("orchestrator", "import rejected"));
        }
        self.imports
            .lock()
            .unwrap()
            .push((worker_id.to_string(), artifact.to_string()));
        let n = self.next_lab.fetch_add(1, Ordering::SeqCst);
        Ok(format!("lab-{n}"))
    }

    async fn start(&self, lab_id: &str) -> CollaboratorResult<()> {
        if *self.fail_starts.lock().unwrap() {
            return Err(CollaboratorError::call("orchestrator", "lab start refused"));
        }
        self.starts.lock().unwrap().push(lab_id.to_string());
        Ok(())
    }

    async fn stop(&self, lab_id: &str) -> CollaboratorResult<()> {
        self.stops.lock().unwrap().push(lab_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeProvider {
    pub provisioned: Mutex<Vec<String>>,
    pub started: Mutex<Vec<WorkerId>>,
    pub stopped: Mutex<Vec<WorkerId>>,
    pub terminated: Mutex<Vec<WorkerId>>,
    next_worker: AtomicU64,
}

#[async_trait]
impl CapacityProvider for FakeProvider {
    async fn provision(&self, template: &WorkerTemplate) -> CollaboratorResult<WorkerId> {
        self.provisioned.lock().unwrap().push(template.id.clone());
        let n = self.next_worker.fetch_add(1, Ordering::SeqCst);
        Ok(format!("w-prov-{n}"))
    }

    async fn start(&self, worker_id: &str) -> CollaboratorResult<()> {
        self.started.lock().unwrap().push(worker_id.to_string());
        Ok(())
    }

    async fn stop(&self, worker_id: &str) -> CollaboratorResult<()> {
        self.stopped.lock().unwrap().push(worker_id.to_string());
        Ok(())
    }

    async fn terminate(&self, worker_id: &str) -> CollaboratorResult<()> {
        self.terminated.lock().unwrap().push(worker_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<DomainEvent>>,
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: DomainEvent) -> CollaboratorResult<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

impl RecordingSink {
    pub fn count(&self, kind: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind() == kind)
            .count()
    }
}

#[derive(Default)]
pub struct RecordingAssessment {
    pub notices: Mutex<Vec<(InstanceId, serde_json::Value)>>,
}

#[async_trait]
impl ExternalAssessment for RecordingAssessment {
    async fn notify(
        &self,
        instance_id: &InstanceId,
        evidence: serde_json::Value,
    ) -> CollaboratorResult<()> {
        self.notices
            .lock()
            .unwrap()
            .push((instance_id.clone(), evidence));
        Ok(())
    }
}

pub struct Harness {
    pub engine: LabletEngine,
    pub triggers: TriggerReceiver,
    pub state: StateStore,
    pub clock: Arc<ManualClock>,
    pub artifacts: Arc<MemoryArtifacts>,
    pub orchestrator: Arc<FakeOrchestrator>,
    pub provider: Arc<FakeProvider>,
    pub sink: Arc<RecordingSink>,
    pub assessment: Arc<RecordingAssessment>,
}

pub struct Fakes {
    pub clock: Arc<ManualClock>,
    pub artifacts: Arc<MemoryArtifacts>,
    pub orchestrator: Arc<FakeOrchestrator>,
    pub provider: Arc<FakeProvider>,
    pub sink: Arc<RecordingSink>,
    pub assessment: Arc<RecordingAssessment>,
}

impl Fakes {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ManualClock::new(NOW)),
            artifacts: Arc::new(MemoryArtifacts::default()),
            orchestrator: Arc::new(FakeOrchestrator::default()),
            provider: Arc::new(FakeProvider::default()),
            sink: Arc::new(RecordingSink::default()),
            assessment: Arc::new(RecordingAssessment::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            artifacts: self.artifacts.clone(),
            orchestrator: self.orchestrator.clone(),
            provider: self.provider.clone(),
            sink: self.sink.clone(),
            assessment: self.assessment.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::open(config, StateStore::open_in_memory().unwrap(), Fakes::new())
    }

    /// Build an engine over an existing store, e.g. to simulate a restart.
    pub fn open(config: EngineConfig, state: StateStore, fakes: Fakes) -> Self {
        let (tx, rx) = trigger_channel();
        let engine =
            LabletEngine::new(&config, state.clone(), fakes.collaborators(), tx).unwrap();
        Self {
            engine,
            triggers: rx,
            state,
            clock: fakes.clock,
            artifacts: fakes.artifacts,
            orchestrator: fakes.orchestrator,
            provider: fakes.provider,
            sink: fakes.sink,
            assessment: fakes.assessment,
        }
    }

    /// Let spawned work finish and apply every trigger it sends back.
    pub async fn pump(&mut self) {
        while let Ok(Some(trigger)) =
            tokio::time::timeout(Duration::from_millis(200), self.triggers.recv()).await
        {
            self.engine.handle(trigger).await.unwrap();
        }
    }

    pub fn add_worker(&self, id: &str, license: LicenseType, ports: PortRange) {
        self.engine
            .register_worker(worker(id, license, ports, WorkerStatus::Running))
            .unwrap();
    }

    pub async fn add_definition(&self, id: &str, nodes: u32, ports: &[&str]) -> LabletDefinition {
        self.engine
            .register_definition(definition(id, nodes, ports))
            .await
            .unwrap()
    }
}

pub fn worker(id: &str, license: LicenseType, ports: PortRange, status: WorkerStatus) -> Worker {
    Worker {
        id: id.to_string(),
        template_id: "static".to_string(),
        license_type: license,
        capacity: lablet_core::Capacity::new(64, 256, 2000, license.default_node_ceiling(20)),
        nested_virt: false,
        port_range: ports,
        image: "ami-cml-2.7".to_string(),
        status,
        status_since: NOW,
    }
}

pub fn definition(id: &str, nodes: u32, ports: &[&str]) -> LabletDefinition {
    LabletDefinition {
        id: id.to_string(),
        version: semver::Version::new(1, 0, 0),
        resources: ResourceRequirements {
            cpu_cores: 4,
            memory_gb: 16,
            storage_gb: 50,
            nested_virt: false,
        },
        license_affinity: [LicenseType::Personal].into_iter().collect(),
        node_count: nodes,
        port_template: ports.iter().map(|p| p.to_string()).collect(),
        ami_requirements: None,
        max_duration_secs: 4 * 3600,
        artifact_uri: format!("s3://labs/{id}.yaml"),
        artifact_digest: None,
        assessment: false,
    }
}

pub fn reservation(id: &str, def: &LabletDefinition, start: u64, end: u64) -> Reservation {
    Reservation {
        id: id.to_string(),
        definition: DefinitionRef::new(&def.id, def.version.clone()),
        timeslot: Timeslot::new(start, end),
        owner_id: "student".to_string(),
        priority: 1,
        warm_lab: None,
    }
}
