//! Domain events published through the [`EventSink`](crate::EventSink).

use serde::{Deserialize, Serialize};

use crate::types::{
    InstanceId, InstanceState, ReservationId, ScalingAction, ScalingReason, WorkerId,
    WorkerStatus,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// An instance entered `to`. `from` is `None` when the instance was created.
    InstanceTransitioned {
        instance_id: InstanceId,
        reservation_id: ReservationId,
        from: Option<InstanceState>,
        to: InstanceState,
        trigger: String,
        at: u64,
    },
    ReservationQueued {
        reservation_id: ReservationId,
        instance_id: InstanceId,
        reason: String,
        at: u64,
    },
    ReservationExpired {
        reservation_id: ReservationId,
        instance_id: InstanceId,
        at: u64,
    },
    WorkerStatusChanged {
        worker_id: WorkerId,
        from: WorkerStatus,
        to: WorkerStatus,
        at: u64,
    },
    ScalingDecided {
        decision_id: String,
        reason: ScalingReason,
        action: ScalingAction,
        worker_id: Option<WorkerId>,
        template_id: Option<String>,
        at: u64,
    },
    ProvisioningFailed {
        decision_id: String,
        template_id: Option<String>,
        worker_id: Option<WorkerId>,
        attempts: u32,
        error: String,
        at: u64,
    },
}

impl DomainEvent {
    /// CloudEvents-style type string.
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::InstanceTransitioned { .. } => "lablet.instance.transitioned",
            DomainEvent::ReservationQueued { .. } => "lablet.reservation.queued",
            DomainEvent::ReservationExpired { .. } => "lablet.reservation.expired",
            DomainEvent::WorkerStatusChanged { .. } => "lablet.worker.status_changed",
            DomainEvent::ScalingDecided { .. } => "lablet.scaling.decided",
            DomainEvent::ProvisioningFailed { .. } => "lablet.scaling.provisioning_failed",
        }
    }
}
