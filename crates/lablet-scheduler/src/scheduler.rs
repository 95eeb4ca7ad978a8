//! SchedulingEngine: matches reservations to workers.
//!
//! `submit` validates a reservation, creates its PENDING instance and
//! tries to place it immediately. Anything that cannot be placed now
//! goes to the [`ReservationQueue`] and is retried by `sweep`, which the
//! owner calls after every capacity-changing event and periodically.
//! Running or scheduled instances are never evicted to make room.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use lablet_capacity::{CapacityError, CapacityLedger, PortAllocator, WorkerFleet};
use lablet_core::{
    Clock, DefinitionRef, DomainEvent, EventSink, InstanceId, LabletDefinition, LabletInstance,
    Reservation, ReservationId, Timeslot, WorkerId, WorkerStatus, WorkerTemplate,
};
use lablet_lifecycle::{LifecycleStateMachine, Outcome, Trigger};
use lablet_placement::{Ranking, Rejection, Requirements, collect_candidates, rank_candidates, shape_fits};
use lablet_state::StateStore;

use crate::error::{SchedulerError, SchedulerResult};
use crate::executor::PlacementExecutor;
use crate::queue::{QueuedReservation, ReservationQueue};

/// Id of the instance that carries a reservation.
pub fn instance_id_for(reservation_id: &str) -> InstanceId {
    format!("inst-{reservation_id}")
}

/// A successful binding.
#[derive(Debug, Clone)]
pub struct Placement {
    pub worker_id: WorkerId,
    pub instance: LabletInstance,
}

/// Why no worker could take a reservation right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shortfall {
    /// No RUNNING worker of an allowed license.
    NoEligibleWorker,
    InsufficientCapacity,
    PortExhaustion,
}

impl fmt::Display for Shortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Shortfall::NoEligibleWorker => "no eligible worker",
            Shortfall::InsufficientCapacity => "insufficient capacity",
            Shortfall::PortExhaustion => "port exhaustion",
        };
        f.write_str(s)
    }
}

impl Shortfall {
    fn classify(ranking: &Ranking) -> Self {
        if ranking.port_bound() {
            Shortfall::PortExhaustion
        } else if ranking
            .rejected
            .values()
            .any(|r| !matches!(r, Rejection::License(_) | Rejection::NotRunning(_)))
        {
            Shortfall::InsufficientCapacity
        } else {
            Shortfall::NoEligibleWorker
        }
    }
}

/// Profile of a reservation the current fleet could not place.
#[derive(Debug, Clone)]
pub struct UnmetDemand {
    pub reservation_id: ReservationId,
    pub instance_id: InstanceId,
    pub definition: DefinitionRef,
    pub timeslot: Timeslot,
    pub requirements: Requirements,
    pub shortfall: Shortfall,
    /// Set when the reservation may only run on one (warm) worker.
    pub pinned_worker: Option<WorkerId>,
}

/// What one sweep did.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub placed: Vec<Placement>,
    pub expired: Vec<ReservationId>,
    pub unmet: Vec<UnmetDemand>,
}

pub struct SchedulingEngine {
    fleet: Arc<WorkerFleet>,
    ledger: Arc<CapacityLedger>,
    ports: Arc<PortAllocator>,
    lifecycle: Arc<LifecycleStateMachine>,
    executor: Arc<PlacementExecutor>,
    state: StateStore,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    templates: Vec<WorkerTemplate>,
    queue: Mutex<ReservationQueue>,
    sweep_gate: tokio::sync::Mutex<()>,
}

impl SchedulingEngine {
    pub fn new(
        fleet: Arc<WorkerFleet>,
        ledger: Arc<CapacityLedger>,
        ports: Arc<PortAllocator>,
        lifecycle: Arc<LifecycleStateMachine>,
        state: StateStore,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            executor: Arc::new(PlacementExecutor::new(
                fleet.clone(),
                ledger.clone(),
                ports.clone(),
            )),
            fleet,
            ledger,
            ports,
            lifecycle,
            state,
            sink,
            clock,
            templates: Vec::new(),
            queue: Mutex::new(ReservationQueue::new()),
            sweep_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Worker templates the capacity provider can build; a reservation
    /// that fits one of them is queued rather than rejected.
    pub fn with_templates(mut self, templates: Vec<WorkerTemplate>) -> Self {
        self.templates = templates;
        self
    }

    fn queue(&self) -> MutexGuard<'_, ReservationQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shared with the scaling controller so scale-down and placement
    /// serialize per worker.
    pub fn executor(&self) -> &Arc<PlacementExecutor> {
        &self.executor
    }

    pub fn queue_depth(&self) -> usize {
        self.queue().len()
    }

    pub fn queued(&self) -> Vec<QueuedReservation> {
        self.queue().snapshot()
    }

    /// Validate, create the PENDING instance, and try to place it now.
    ///
    /// Returns [`SchedulerError::Queued`] when the reservation had to wait
    /// and [`SchedulerError::Rejected`] when it can never be satisfied.
    pub async fn submit(&self, reservation: Reservation) -> SchedulerResult<Placement> {
        let now = self.clock.now();
        let requirements = self.validate(&reservation, now)?;

        let instance_id = instance_id_for(&reservation.id);
        if self.queue().contains(&reservation.id) || self.lifecycle.get(&instance_id)?.is_some() {
            return Err(rejected(&reservation.id, "duplicate reservation id"));
        }
        self.lifecycle.create(&instance_id, &reservation).await?;

        match self.try_place(&reservation, &instance_id, &requirements).await? {
            Ok(placement) => Ok(placement),
            Err(shortfall) => {
                let unmet = self.enqueue(reservation, instance_id, requirements, shortfall, now).await?;
                Err(SchedulerError::Queued(Box::new(unmet)))
            }
        }
    }

    fn validate(&self, reservation: &Reservation, now: u64) -> SchedulerResult<Requirements> {
        let slot = reservation.timeslot;
        if !slot.is_well_formed() {
            return Err(rejected(&reservation.id, "timeslot end must be after its start"));
        }
        if slot.end <= now {
            return Err(rejected(&reservation.id, "timeslot has already ended"));
        }

        let definition = self
            .state
            .get_definition(&reservation.definition)?
            .ok_or_else(|| {
                rejected(
                    &reservation.id,
                    &format!("unknown definition {}", reservation.definition),
                )
            })?;
        if slot.duration_secs() > definition.max_duration_secs {
            return Err(rejected(
                &reservation.id,
                &format!(
                    "timeslot of {}s exceeds the definition's maximum of {}s",
                    slot.duration_secs(),
                    definition.max_duration_secs
                ),
            ));
        }

        let requirements = Requirements::from_definition(&definition)
            .map_err(|e| rejected(&reservation.id, &e.to_string()))?;
        if !self.feasible(reservation, &definition, &requirements) {
            return Err(rejected(
                &reservation.id,
                "no worker or worker template can satisfy its license, node and resource needs",
            ));
        }
        Ok(requirements)
    }

    /// Could any known worker, or any worker the provider could build,
    /// ever host this reservation?
    fn feasible(&self, reservation: &Reservation, def: &LabletDefinition, req: &Requirements) -> bool {
        let workers = self
            .fleet
            .list()
            .into_iter()
            .filter(|w| w.status != WorkerStatus::Terminated);

        if let Some(warm) = &reservation.warm_lab {
            return workers.filter(|w| w.id == warm.worker_id).any(|w| {
                shape_fits(w.license_type, &w.capacity, w.nested_virt, &w.port_range, &w.image, req)
            });
        }

        let fits_worker = workers
            .into_iter()
            .any(|w| shape_fits(w.license_type, &w.capacity, w.nested_virt, &w.port_range, &w.image, req));
        let fits_template = self
            .templates
            .iter()
            .any(|t| shape_fits(t.license_type, &t.capacity, t.nested_virt, &t.port_range, &t.image, req));
        if !(fits_worker || fits_template) {
            debug!(definition = %def.reference(), "statically infeasible");
        }
        fits_worker || fits_template
    }

    async fn try_place(
        &self,
        reservation: &Reservation,
        instance_id: &str,
        req: &Requirements,
    ) -> SchedulerResult<Result<Placement, Shortfall>> {
        let mut candidates = collect_candidates(&self.fleet, &self.ledger, &self.ports);
        if let Some(warm) = &reservation.warm_lab {
            candidates.retain(|c| c.worker.id == warm.worker_id);
        }
        let ranking = rank_candidates(candidates, req);
        let mut shortfall = Shortfall::classify(&ranking);

        for scored in &ranking.ranked {
            let worker_id = scored.worker_id();
            match self
                .executor
                .commit(worker_id, instance_id, req.demand, req.port_count)
            {
                Ok((lease, allocation)) => {
                    return match self
                        .lifecycle
                        .bind(instance_id, lease.clone(), allocation.clone())
                        .await
                    {
                        Ok(instance) => {
                            info!(
                                reservation = %reservation.id,
                                instance = %instance_id,
                                worker = %worker_id,
                                slack = scored.slack,
                                ports = ?allocation.ports,
                                "reservation placed"
                            );
                            Ok(Ok(Placement {
                                worker_id: worker_id.to_string(),
                                instance,
                            }))
                        }
                        Err(e) => {
                            self.executor.rollback(&lease, &allocation)?;
                            Err(e.into())
                        }
                    };
                }
                // Snapshot was stale; another commit took the room.
                Err(CapacityError::InsufficientCapacity { .. }) => {
                    debug!(worker = %worker_id, instance = %instance_id, "capacity taken concurrently");
                    shortfall = Shortfall::InsufficientCapacity;
                }
                Err(CapacityError::PortExhaustion { .. }) => {
                    debug!(worker = %worker_id, instance = %instance_id, "ports taken concurrently");
                    shortfall = Shortfall::PortExhaustion;
                }
                Err(CapacityError::WorkerNotRunning { status, .. }) => {
                    debug!(worker = %worker_id, instance = %instance_id, %status, "worker left RUNNING");
                }
                Err(e) => return Err(e.into()),
            }
        }

        debug!(reservation = %reservation.id, %shortfall, "no worker accepted reservation");
        Ok(Err(shortfall))
    }

    async fn enqueue(
        &self,
        reservation: Reservation,
        instance_id: InstanceId,
        requirements: Requirements,
        shortfall: Shortfall,
        now: u64,
    ) -> SchedulerResult<UnmetDemand> {
        self.state.put_reservation(&reservation)?;
        let fresh = self.queue().push(QueuedReservation {
            reservation: reservation.clone(),
            instance_id: instance_id.clone(),
            queued_at: now,
        });

        if fresh {
            info!(
                reservation = %reservation.id,
                instance = %instance_id,
                %shortfall,
                depth = self.queue_depth(),
                "reservation queued"
            );
            let event = DomainEvent::ReservationQueued {
                reservation_id: reservation.id.clone(),
                instance_id: instance_id.clone(),
                reason: shortfall.to_string(),
                at: now,
            };
            if let Err(e) = self.sink.publish(event).await {
                warn!(error = %e, "failed to publish queue event");
            }
        }

        Ok(UnmetDemand {
            reservation_id: reservation.id,
            instance_id,
            definition: reservation.definition,
            timeslot: reservation.timeslot,
            requirements,
            shortfall,
            pinned_worker: reservation.warm_lab.map(|w| w.worker_id),
        })
    }

    /// Expire reservations whose timeslot ended, then retry every queued
    /// reservation in queue order.
    pub async fn sweep(&self) -> SchedulerResult<SweepReport> {
        let _gate = self.sweep_gate.lock().await;
        let now = self.clock.now();
        let mut report = SweepReport::default();

        let expired = self.queue().drain_expired(now);
        for entry in expired {
            let id = entry.reservation.id;
            self.lifecycle.fire(&entry.instance_id, Trigger::Expire).await?;
            self.state.delete_reservation(&id)?;
            info!(reservation = %id, instance = %entry.instance_id, "queued reservation expired");
            let event = DomainEvent::ReservationExpired {
                reservation_id: id.clone(),
                instance_id: entry.instance_id,
                at: now,
            };
            if let Err(e) = self.sink.publish(event).await {
                warn!(error = %e, "failed to publish expiry event");
            }
            report.expired.push(id);
        }

        let pending = self.queue().snapshot();
        for entry in pending {
            let reservation = entry.reservation;
            if !self.queue().contains(&reservation.id) {
                continue;
            }
            let Some(definition) = self.state.get_definition(&reservation.definition)? else {
                warn!(reservation = %reservation.id, definition = %reservation.definition, "queued reservation lost its definition");
                continue;
            };
            let requirements = match Requirements::from_definition(&definition) {
                Ok(req) => req,
                Err(e) => {
                    warn!(reservation = %reservation.id, error = %e, "cannot evaluate queued reservation");
                    continue;
                }
            };

            match self.try_place(&reservation, &entry.instance_id, &requirements).await {
                Ok(Ok(placement)) => {
                    self.queue().remove(&reservation.id);
                    self.state.delete_reservation(&reservation.id)?;
                    report.placed.push(placement);
                }
                Ok(Err(shortfall)) => report.unmet.push(UnmetDemand {
                    reservation_id: reservation.id,
                    instance_id: entry.instance_id,
                    definition: reservation.definition,
                    timeslot: reservation.timeslot,
                    requirements,
                    shortfall,
                    pinned_worker: reservation.warm_lab.map(|w| w.worker_id),
                }),
                // Cancelled between snapshot and bind.
                Err(SchedulerError::Lifecycle(e)) if !e.is_fatal() => {
                    warn!(reservation = %reservation.id, error = %e, "queued reservation skipped");
                }
                Err(e) => return Err(e),
            }
        }

        debug!(
            placed = report.placed.len(),
            expired = report.expired.len(),
            waiting = report.unmet.len(),
            "sweep complete"
        );
        Ok(report)
    }

    /// Cancel a reservation: dequeue it if waiting, then cancel its instance.
    pub async fn cancel(&self, reservation_id: &str) -> SchedulerResult<Outcome> {
        let instance_id = match self.queue().remove(reservation_id) {
            Some(entry) => entry.instance_id,
            None => instance_id_for(reservation_id),
        };
        self.state.delete_reservation(reservation_id)?;
        if self.lifecycle.get(&instance_id)?.is_none() {
            return Err(SchedulerError::UnknownReservation(reservation_id.to_string()));
        }
        let outcome = self.lifecycle.fire(&instance_id, Trigger::Cancel).await?;
        info!(reservation = %reservation_id, instance = %instance_id, "reservation cancelled");
        Ok(outcome)
    }

    /// Put recovered reservations back in the queue (startup reconciliation).
    pub fn restore_queue(&self, entries: Vec<QueuedReservation>) -> usize {
        let mut queue = self.queue();
        entries.into_iter().filter(|e| queue.push(e.clone())).count()
    }
}

fn rejected(reservation_id: &str, reason: &str) -> SchedulerError {
    SchedulerError::Rejected {
        reservation_id: reservation_id.to_string(),
        reason: reason.to_string(),
    }
}
