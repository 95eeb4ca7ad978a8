//! lablet-engine: the Lablet scheduling & capacity engine, assembled.
//!
//! # Components
//!
//! - **`catalog`**: `DefinitionCatalog`: immutable definition versions and their artifacts
//! - **`trigger`**: `InboundTrigger` and the channel completions arrive on
//! - **`engine`**: `LabletEngine`: requests, trigger dispatch, tick, reconciliation
//!
//! # Example
//!
//! ```text
//! let (tx, rx) = trigger_channel();
//! let engine = LabletEngine::new(&config, store, collaborators, tx)?;
//! engine.reconcile().await?;
//! engine.run(rx, shutdown).await?;
//! ```

pub mod catalog;
pub mod engine;
pub mod error;
pub mod trigger;

pub use catalog::DefinitionCatalog;
pub use engine::{Collaborators, LabletEngine, ReconcileReport};
pub use error::{EngineError, EngineResult};
pub use trigger::{InboundTrigger, TriggerReceiver, TriggerSender, trigger_channel};
