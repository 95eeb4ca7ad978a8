//! lablet-core: shared types for the lablet scheduling & capacity engine.
//!
//! Everything here is plain data or a seam to the outside world:
//!
//! - **`types`**: definitions, workers, reservations, instances, leases
//! - **`config`**: `lablet.toml` parsing and validation
//! - **`duration`**: `"30s"` / `"5m"` / `"2h"` duration strings
//! - **`source`**: artifact URIs and content digests
//! - **`clock`**: injected time source
//! - **`collab`**: traits for the external collaborators
//! - **`events`**: domain events published to the event sink

pub mod clock;
pub mod collab;
pub mod config;
pub mod duration;
pub mod events;
pub mod source;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collab::{
    Artifact, ArtifactStore, CapacityProvider, CollaboratorError, CollaboratorResult, EventSink,
    ExternalAssessment, LabOrchestrator,
};
pub use config::{
    ConfigError, EngineConfig, LicenseConfig, ScalingConfig, ScalingPolicy, SchedulerConfig,
    StaticWorkerConfig, WorkerTemplateConfig,
};
pub use events::DomainEvent;
pub use source::{ArtifactUri, ContentDigest, SourceError};
pub use types::*;
