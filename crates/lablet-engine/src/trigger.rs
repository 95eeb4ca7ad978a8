//! Inbound triggers.
//!
//! Everything that happens outside the engine (an import finishing, a
//! worker booting, an assessment completing) comes back as one of these
//! on a single channel, so the engine applies them one at a time.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use lablet_core::{InstanceId, WorkerId};
use lablet_lifecycle::Trigger;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundTrigger {
    /// A payload-free lifecycle trigger, e.g. `collection.completed`.
    ///
    /// Only external completions, `restart`, `stop_requested` and
    /// `cancel` are accepted here.
    Instance {
        instance_id: InstanceId,
        trigger: Trigger,
    },
    /// Lab imported (or warm lab found) and started.
    ImportSucceeded {
        instance_id: InstanceId,
        lab_id: String,
    },
    ImportFailed {
        instance_id: InstanceId,
        error: String,
    },
    /// The lab stop call failed; it is retried on the next tick.
    StopFailed {
        instance_id: InstanceId,
        error: String,
    },
    /// A restarted instance's lab would not start; the instance is stopped.
    RestartFailed {
        instance_id: InstanceId,
        error: String,
    },
    WorkerReady {
        worker_id: WorkerId,
    },
    WorkerStopped {
        worker_id: WorkerId,
    },
    WorkerTerminated {
        worker_id: WorkerId,
    },
}

impl InboundTrigger {
    pub fn instance(instance_id: &str, trigger: Trigger) -> Self {
        InboundTrigger::Instance {
            instance_id: instance_id.to_string(),
            trigger,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundTrigger::Instance { trigger, .. } => trigger.as_str(),
            InboundTrigger::ImportSucceeded { .. } => "import.succeeded",
            InboundTrigger::ImportFailed { .. } => "import.failed",
            InboundTrigger::StopFailed { .. } => "stop.failed",
            InboundTrigger::RestartFailed { .. } => "restart.failed",
            InboundTrigger::WorkerReady { .. } => "worker.ready",
            InboundTrigger::WorkerStopped { .. } => "worker.stopped",
            InboundTrigger::WorkerTerminated { .. } => "worker.terminated",
        }
    }
}

pub type TriggerSender = mpsc::UnboundedSender<InboundTrigger>;
pub type TriggerReceiver = mpsc::UnboundedReceiver<InboundTrigger>;

pub fn trigger_channel() -> (TriggerSender, TriggerReceiver) {
    mpsc::unbounded_channel()
}
