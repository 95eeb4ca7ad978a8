//! LabletEngine: one scheduling authority per process.
//!
//! The engine owns one of each component and is the only caller of the
//! lifecycle machine outside the scheduler. It reacts to three inputs:
//!
//! - requests (`register_definition`, `submit`, `cancel`)
//! - inbound triggers, delivered one at a time through a channel
//! - a periodic tick: queue sweep, timeslot driver, scale-down
//!
//! Imports, lab starts and stops, assessment notices and provider calls
//! run in spawned tasks; their completions come back as triggers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use lablet_autoscale::ScalingController;
use lablet_capacity::{CapacityLedger, PortAllocator, WorkerFleet, rewrite_artifact, rewrite_template};
use lablet_core::{
    ArtifactStore, CapacityProvider, Clock, EngineConfig, EventSink, ExternalAssessment,
    InstanceId, InstanceState, LabOrchestrator, LabletDefinition, LabletInstance, Reservation,
    ReservationId, StaticWorkerConfig, Worker, WorkerStatus, WorkerTemplate,
};
use lablet_lifecycle::{LifecycleError, LifecycleStateMachine, Outcome, Trigger};
use lablet_scheduler::{
    Placement, QueuedReservation, SchedulerError, SchedulingEngine, SweepReport, UnmetDemand,
};
use lablet_state::StateStore;

use crate::catalog::DefinitionCatalog;
use crate::error::{EngineError, EngineResult};
use crate::trigger::{InboundTrigger, TriggerReceiver, TriggerSender};

/// The engine's view of the outside world.
#[derive(Clone)]
pub struct Collaborators {
    pub artifacts: Arc<dyn ArtifactStore>,
    pub orchestrator: Arc<dyn LabOrchestrator>,
    pub provider: Arc<dyn CapacityProvider>,
    pub sink: Arc<dyn EventSink>,
    pub assessment: Arc<dyn ExternalAssessment>,
    pub clock: Arc<dyn Clock>,
}

/// What startup reconciliation rebuilt.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub workers: usize,
    pub instances: usize,
    pub queued: usize,
}

pub struct LabletEngine {
    fleet: Arc<WorkerFleet>,
    lifecycle: Arc<LifecycleStateMachine>,
    scheduler: SchedulingEngine,
    scaler: Arc<ScalingController>,
    catalog: Arc<DefinitionCatalog>,
    orchestrator: Arc<dyn LabOrchestrator>,
    assessment: Arc<dyn ExternalAssessment>,
    state: StateStore,
    clock: Arc<dyn Clock>,
    templates: Vec<WorkerTemplate>,
    triggers: TriggerSender,
    sweep_interval: Duration,
    /// Instances with an import or lab stop in flight.
    in_flight: Mutex<HashSet<InstanceId>>,
    /// Cancelled instances that go straight to TERMINATED once stopped.
    retiring: Mutex<HashSet<InstanceId>>,
    scaling_down: Arc<AtomicBool>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Payload-free triggers that may arrive on the inbound channel. `cancel`
/// is routed through the scheduler separately.
fn accepts_from_outside(trigger: Trigger) -> bool {
    trigger.is_external() || matches!(trigger, Trigger::Restart | Trigger::StopRequested)
}

impl LabletEngine {
    /// Build the engine from validated configuration. Completions of
    /// spawned work are sent on `triggers`; feed the matching receiver to
    /// [`LabletEngine::run`].
    pub fn new(
        config: &EngineConfig,
        state: StateStore,
        collaborators: Collaborators,
        triggers: TriggerSender,
    ) -> EngineResult<Self> {
        config.validate()?;
        let policy = config.scaling.policy()?;
        let sweep_interval = config.sweep_interval()?;
        let templates = config.templates();

        let Collaborators {
            artifacts,
            orchestrator,
            provider,
            sink,
            assessment,
            clock,
        } = collaborators;

        let fleet = Arc::new(WorkerFleet::new());
        let ledger = Arc::new(CapacityLedger::new());
        let ports = Arc::new(PortAllocator::new());
        let lifecycle = Arc::new(LifecycleStateMachine::new(
            ledger.clone(),
            ports.clone(),
            state.clone(),
            sink.clone(),
            clock.clone(),
        ));
        let scheduler = SchedulingEngine::new(
            fleet.clone(),
            ledger,
            ports,
            lifecycle.clone(),
            state.clone(),
            sink.clone(),
            clock.clone(),
        )
        .with_templates(templates.clone());
        let scaler = ScalingController::new(
            fleet.clone(),
            lifecycle.clone(),
            provider,
            sink,
            state.clone(),
            clock.clone(),
        )
        .with_templates(templates.clone())
        .with_executor(scheduler.executor().clone())
        .with_policy(policy);

        Ok(Self {
            fleet,
            lifecycle,
            scheduler,
            scaler: Arc::new(scaler),
            catalog: Arc::new(DefinitionCatalog::new(state.clone(), artifacts)),
            orchestrator,
            assessment,
            state,
            clock,
            templates,
            triggers,
            sweep_interval,
            in_flight: Mutex::new(HashSet::new()),
            retiring: Mutex::new(HashSet::new()),
            scaling_down: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn fleet(&self) -> &WorkerFleet {
        &self.fleet
    }

    pub fn lifecycle(&self) -> &LifecycleStateMachine {
        &self.lifecycle
    }

    pub fn scheduler(&self) -> &SchedulingEngine {
        &self.scheduler
    }

    pub fn scaler(&self) -> &ScalingController {
        &self.scaler
    }

    pub fn catalog(&self) -> &DefinitionCatalog {
        &self.catalog
    }

    // ── Workers ────────────────────────────────────────────────────

    /// Add a worker to the fleet, the ledger and the port allocator, and
    /// persist it.
    pub fn register_worker(&self, worker: Worker) -> EngineResult<()> {
        self.track_worker(worker.clone())?;
        self.state.put_worker(&worker)?;
        Ok(())
    }

    fn track_worker(&self, worker: Worker) -> EngineResult<()> {
        let ledger = self.lifecycle.ledger();
        let ports = self.lifecycle.ports();
        ledger.register_worker(&worker.id, worker.capacity)?;
        if let Err(e) = ports.register_worker(&worker.id, worker.port_range) {
            ledger.deregister_worker(&worker.id)?;
            return Err(e.into());
        }
        if let Err(e) = self.fleet.register(worker.clone()) {
            ports.deregister_worker(&worker.id)?;
            ledger.deregister_worker(&worker.id)?;
            return Err(e.into());
        }
        Ok(())
    }

    /// Register statically configured workers that the store does not
    /// already know about. They are taken to be RUNNING.
    pub fn register_static_workers(&self, workers: &[StaticWorkerConfig]) -> EngineResult<usize> {
        let now = self.clock.now();
        let mut added = 0;
        for config in workers {
            if self.fleet.get(&config.id).is_some() {
                debug!(worker = %config.id, "static worker already known");
                continue;
            }
            let template = self
                .templates
                .iter()
                .find(|t| t.id == config.template)
                .ok_or_else(|| EngineError::UnknownTemplate(config.template.clone()))?;
            let mut worker = template.instantiate(&config.id, now);
            worker.status = WorkerStatus::Running;
            self.register_worker(worker)?;
            added += 1;
        }
        Ok(added)
    }

    // ── Requests ───────────────────────────────────────────────────

    pub async fn register_definition(&self, def: LabletDefinition) -> EngineResult<LabletDefinition> {
        self.catalog.register(def).await
    }

    /// Schedule a reservation now, or queue it and ask for capacity.
    pub async fn submit(&self, reservation: Reservation) -> EngineResult<Placement> {
        match self.scheduler.submit(reservation).await {
            Ok(placement) => {
                self.scaler.settle(&placement.instance.reservation_id);
                Ok(placement)
            }
            Err(SchedulerError::Queued(unmet)) => {
                self.request_scale_up((*unmet).clone());
                Err(SchedulerError::Queued(unmet).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Cancel a reservation wherever it is. Running labs are stopped
    /// first and the instance is then taken straight to TERMINATED.
    pub async fn cancel(&self, reservation_id: &str) -> EngineResult<Outcome> {
        let outcome = self.scheduler.cancel(reservation_id).await?;
        self.scaler.settle(reservation_id);
        if outcome.instance().state == InstanceState::Stopping {
            guard(&self.retiring).insert(outcome.instance().id.clone());
        }
        self.follow(&outcome).await?;
        Ok(outcome)
    }

    // ── Inbound triggers ───────────────────────────────────────────

    /// Apply one inbound trigger. Replays of completions are no-ops.
    pub async fn handle(&self, trigger: InboundTrigger) -> EngineResult<()> {
        debug!(trigger = trigger.kind(), "inbound trigger");
        match trigger {
            InboundTrigger::Instance {
                instance_id,
                trigger: Trigger::Cancel,
            } => {
                let instance = self
                    .lifecycle
                    .get(&instance_id)?
                    .ok_or_else(|| LifecycleError::UnknownInstance(instance_id.clone()))?;
                self.cancel(&instance.reservation_id).await?;
                Ok(())
            }
            InboundTrigger::Instance {
                instance_id,
                trigger,
            } => {
                if !accepts_from_outside(trigger) {
                    warn!(instance = %instance_id, %trigger, "inbound trigger rejected");
                    return Err(EngineError::RejectedTrigger {
                        instance_id,
                        trigger,
                    });
                }
                if trigger == Trigger::WorkerConfirmedStop {
                    self.settle_effect(&instance_id);
                }
                let outcome = self.lifecycle.fire(&instance_id, trigger).await?;
                if trigger == Trigger::Restart && outcome.is_applied() {
                    self.spawn_lab_start(outcome.instance().clone());
                }
                self.follow(&outcome).await
            }
            InboundTrigger::ImportSucceeded {
                instance_id,
                lab_id,
            } => {
                self.settle_effect(&instance_id);
                let outcome = self.lifecycle.mark_running(&instance_id, &lab_id).await?;
                if !outcome.is_applied() && outcome.instance().state.is_terminal() {
                    warn!(instance = %instance_id, lab = %lab_id, "lab started for a terminated instance, stopping it");
                    self.spawn_orphan_stop(lab_id);
                }
                self.follow(&outcome).await
            }
            InboundTrigger::ImportFailed { instance_id, error } => {
                self.settle_effect(&instance_id);
                warn!(instance = %instance_id, %error, "instantiation failed");
                let outcome = self.lifecycle.fire(&instance_id, Trigger::ImportFailed).await?;
                self.follow(&outcome).await
            }
            InboundTrigger::StopFailed { instance_id, error } => {
                self.settle_effect(&instance_id);
                warn!(instance = %instance_id, %error, "lab stop failed, retrying next tick");
                Ok(())
            }
            InboundTrigger::RestartFailed { instance_id, error } => {
                warn!(instance = %instance_id, %error, "lab restart failed, stopping instance");
                let outcome = self
                    .lifecycle
                    .fire(&instance_id, Trigger::StopRequested)
                    .await?;
                self.follow(&outcome).await
            }
            InboundTrigger::WorkerReady { worker_id } => {
                self.scaler
                    .apply_worker_status(&worker_id, WorkerStatus::Running)
                    .await?;
                self.sweep().await?;
                self.drive_timeslots().await
            }
            InboundTrigger::WorkerStopped { worker_id } => {
                self.scaler
                    .apply_worker_status(&worker_id, WorkerStatus::Stopped)
                    .await?;
                Ok(())
            }
            InboundTrigger::WorkerTerminated { worker_id } => {
                self.scaler
                    .apply_worker_status(&worker_id, WorkerStatus::Terminated)
                    .await?;
                self.scheduler.executor().forget(&worker_id);
                Ok(())
            }
        }
    }

    /// Side effects of entering a state.
    async fn follow(&self, outcome: &Outcome) -> EngineResult<()> {
        let Outcome::Applied { instance, .. } = outcome else {
            return Ok(());
        };

        match instance.state {
            InstanceState::Instantiating => self.spawn_instantiation(instance.clone()),
            InstanceState::Collecting => self.spawn_collection_notice(instance.clone()),
            InstanceState::Stopping => self.spawn_lab_stop(instance.clone()),
            InstanceState::Stopped => {
                let cancelled = guard(&self.retiring).remove(&instance.id);
                if cancelled || self.clock.now() >= instance.timeslot.end {
                    self.retire(&instance.id).await?;
                    self.sweep().await?;
                }
            }
            InstanceState::Terminated => {
                guard(&self.retiring).remove(&instance.id);
                if instance.worker_id.is_some() {
                    self.sweep().await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// STOPPED → ARCHIVED → TERMINATED. The instance record is already
    /// durable, so results count as persisted.
    async fn retire(&self, instance_id: &str) -> EngineResult<()> {
        self.lifecycle
            .fire(instance_id, Trigger::ResultsPersisted)
            .await?;
        self.lifecycle
            .fire(instance_id, Trigger::CleanupCompleted)
            .await?;
        info!(instance = %instance_id, "instance retired");
        Ok(())
    }

    // ── Tick ───────────────────────────────────────────────────────

    /// One round of periodic work.
    pub async fn tick(&self) -> EngineResult<()> {
        self.sweep().await?;
        self.drive_timeslots().await?;
        self.redrive_effects();
        self.spawn_scale_down();
        Ok(())
    }

    /// Retry the queue and hand what is still unmet to the scaler.
    pub async fn sweep(&self) -> EngineResult<SweepReport> {
        let report = self.scheduler.sweep().await?;
        for placement in &report.placed {
            self.scaler.settle(&placement.instance.reservation_id);
        }
        for reservation_id in &report.expired {
            self.scaler.settle(reservation_id);
        }
        for unmet in &report.unmet {
            self.request_scale_up(unmet.clone());
        }
        Ok(report)
    }

    /// Move instances along as their timeslots open and close.
    pub async fn drive_timeslots(&self) -> EngineResult<()> {
        let now = self.clock.now();

        for instance in self.lifecycle.in_state(InstanceState::Scheduled) {
            if instance.timeslot.start <= now {
                let result = self.begin(&instance).await;
                self.tolerate(&instance.id, result)?;
            }
        }

        for instance in self.lifecycle.in_state(InstanceState::Running) {
            if instance.timeslot.end <= now {
                let result = self.close(&instance).await;
                self.tolerate(&instance.id, result)?;
            }
        }

        let mut retired = 0;
        for instance in self.lifecycle.in_state(InstanceState::Stopped) {
            if instance.timeslot.end <= now {
                let result = self.retire(&instance.id).await;
                if result.is_ok() {
                    retired += 1;
                }
                self.tolerate(&instance.id, result)?;
            }
        }
        if retired > 0 {
            self.sweep().await?;
        }
        Ok(())
    }

    /// SCHEDULED → INSTANTIATING with the port map fixed.
    async fn begin(&self, instance: &LabletInstance) -> EngineResult<()> {
        let def = self.definition_of(instance)?;
        let mapping = rewrite_template(&def.port_template, instance.ports())?;
        let outcome = self.lifecycle.instantiate(&instance.id, mapping).await?;
        self.follow(&outcome).await
    }

    /// End of timeslot: collect if the definition is assessed, else stop.
    async fn close(&self, instance: &LabletInstance) -> EngineResult<()> {
        let def = self.definition_of(instance)?;
        let trigger = if def.assessment {
            Trigger::CollectionRequested
        } else {
            Trigger::StopRequested
        };
        let outcome = self.lifecycle.fire(&instance.id, trigger).await?;
        self.follow(&outcome).await
    }

    fn definition_of(&self, instance: &LabletInstance) -> EngineResult<LabletDefinition> {
        self.catalog
            .get(&instance.definition)?
            .ok_or_else(|| EngineError::UnknownDefinition(instance.definition.to_string()))
    }

    /// Keep going past a per-instance failure unless it is fatal.
    fn tolerate(&self, instance_id: &str, result: EngineResult<()>) -> EngineResult<()> {
        match result {
            Err(e) if !e.is_fatal() => {
                warn!(instance = %instance_id, error = %e, "timeslot step failed");
                Ok(())
            }
            other => other,
        }
    }

    /// Re-issue imports and stops that have no task in flight, e.g.
    /// after a restart or a failed stop call.
    fn redrive_effects(&self) {
        for instance in self.lifecycle.in_state(InstanceState::Instantiating) {
            self.spawn_instantiation(instance);
        }
        for instance in self.lifecycle.in_state(InstanceState::Stopping) {
            self.spawn_lab_stop(instance);
        }
    }

    // ── Spawned work ───────────────────────────────────────────────

    fn claim_effect(&self, instance_id: &str) -> bool {
        guard(&self.in_flight).insert(instance_id.to_string())
    }

    fn settle_effect(&self, instance_id: &str) {
        guard(&self.in_flight).remove(instance_id);
    }

    fn spawn_instantiation(&self, instance: LabletInstance) {
        if !self.claim_effect(&instance.id) {
            return;
        }
        let catalog = Arc::clone(&self.catalog);
        let orchestrator = Arc::clone(&self.orchestrator);
        let triggers = self.triggers.clone();
        tokio::spawn(async move {
            let instance_id = instance.id.clone();
            let trigger = match instantiate_lab(&catalog, orchestrator.as_ref(), &instance).await {
                Ok(lab_id) => InboundTrigger::ImportSucceeded {
                    instance_id,
                    lab_id,
                },
                Err(e) => InboundTrigger::ImportFailed {
                    instance_id,
                    error: e.to_string(),
                },
            };
            if triggers.send(trigger).is_err() {
                debug!("engine gone, dropping import result");
            }
        });
    }

    fn spawn_lab_stop(&self, instance: LabletInstance) {
        if !self.claim_effect(&instance.id) {
            return;
        }
        let orchestrator = Arc::clone(&self.orchestrator);
        let triggers = self.triggers.clone();
        tokio::spawn(async move {
            let result = match &instance.lab_id {
                Some(lab_id) => orchestrator.stop(lab_id).await,
                None => Ok(()),
            };
            let trigger = match result {
                Ok(()) => InboundTrigger::instance(&instance.id, Trigger::WorkerConfirmedStop),
                Err(e) => InboundTrigger::StopFailed {
                    instance_id: instance.id.clone(),
                    error: e.to_string(),
                },
            };
            if triggers.send(trigger).is_err() {
                debug!("engine gone, dropping stop result");
            }
        });
    }

    /// Start the lab of an instance restarted from STOPPED.
    fn spawn_lab_start(&self, instance: LabletInstance) {
        let orchestrator = Arc::clone(&self.orchestrator);
        let triggers = self.triggers.clone();
        tokio::spawn(async move {
            let result = match &instance.lab_id {
                Some(lab_id) => orchestrator.start(lab_id).await.map_err(|e| e.to_string()),
                None => Err("instance has no lab".to_string()),
            };
            match result {
                Ok(()) => info!(instance = %instance.id, "lab restarted"),
                Err(error) => {
                    let trigger = InboundTrigger::RestartFailed {
                        instance_id: instance.id.clone(),
                        error,
                    };
                    if triggers.send(trigger).is_err() {
                        debug!("engine gone, dropping restart result");
                    }
                }
            }
        });
    }

    fn spawn_orphan_stop(&self, lab_id: String) {
        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::spawn(async move {
            if let Err(e) = orchestrator.stop(&lab_id).await {
                warn!(lab = %lab_id, error = %e, "best-effort lab stop failed");
            }
        });
    }

    fn spawn_collection_notice(&self, instance: LabletInstance) {
        let assessment = Arc::clone(&self.assessment);
        tokio::spawn(async move {
            let evidence = serde_json::json!({
                "reservation_id": instance.reservation_id,
                "definition": instance.definition.to_string(),
                "owner_id": instance.owner_id,
                "worker_id": instance.worker_id,
                "lab_id": instance.lab_id,
                "ports": instance.allocated_ports,
            });
            if let Err(e) = assessment.notify(&instance.id, evidence).await {
                warn!(instance = %instance.id, error = %e, "collection notice failed");
            }
        });
    }

    fn request_scale_up(&self, unmet: UnmetDemand) {
        let scaler = Arc::clone(&self.scaler);
        let depth = self.scheduler.queue_depth();
        tokio::spawn(async move {
            match scaler.on_unmet_demand(&unmet, depth).await {
                Ok(Some(decision)) => debug!(
                    reservation = %unmet.reservation_id,
                    decision = %decision.id,
                    "scale-up requested"
                ),
                Ok(None) => {}
                Err(e) => warn!(reservation = %unmet.reservation_id, error = %e, "scale-up failed"),
            }
        });
    }

    fn spawn_scale_down(&self) {
        if self.scaling_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let scaler = Arc::clone(&self.scaler);
        let running = Arc::clone(&self.scaling_down);
        tokio::spawn(async move {
            if let Err(e) = scaler.scale_down_sweep().await {
                warn!(error = %e, "scale-down sweep failed");
            }
            running.store(false, Ordering::SeqCst);
        });
    }

    // ── Startup and run loop ───────────────────────────────────────

    /// Rebuild in-memory state from the store: workers into the fleet,
    /// ledger and allocator; non-terminal instances re-debited; PENDING
    /// instances back in the queue. Run before accepting requests.
    pub async fn reconcile(&self) -> EngineResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for worker in self.state.list_workers()? {
            if self.fleet.get(&worker.id).is_some() {
                continue;
            }
            self.track_worker(worker)?;
            report.workers += 1;
        }

        let mut active = Vec::new();
        for instance in self.state.list_active_instances()? {
            let orphaned = instance
                .worker_id
                .as_deref()
                .is_some_and(|w| self.fleet.get(w).is_none());
            if orphaned {
                error!(
                    instance = %instance.id,
                    worker = ?instance.worker_id,
                    "instance bound to an unknown worker, not restored"
                );
                continue;
            }
            active.push(instance);
        }

        let pending: Vec<LabletInstance> = active
            .iter()
            .filter(|i| i.state == InstanceState::Pending)
            .cloned()
            .collect();
        report.instances = self.lifecycle.restore(active)?;

        let reservations: HashMap<ReservationId, Reservation> = self
            .state
            .list_reservations()?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        let entries: Vec<QueuedReservation> = pending
            .into_iter()
            .filter_map(|instance| match reservations.get(&instance.reservation_id) {
                Some(reservation) => Some(QueuedReservation {
                    reservation: reservation.clone(),
                    instance_id: instance.id,
                    queued_at: instance.created_at,
                }),
                None => {
                    warn!(instance = %instance.id, "pending instance has no stored reservation");
                    None
                }
            })
            .collect();
        report.queued = self.scheduler.restore_queue(entries);

        info!(
            workers = report.workers,
            instances = report.instances,
            queued = report.queued,
            "reconciliation complete"
        );
        Ok(report)
    }

    /// Apply triggers and tick until shutdown. A fatal error stops the
    /// loop and is returned; anything else is logged.
    pub async fn run(
        &self,
        mut triggers: TriggerReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) -> EngineResult<()> {
        info!(interval_secs = self.sweep_interval.as_secs(), "engine started");
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(trigger) = triggers.recv() => {
                    let kind = trigger.kind();
                    if let Err(e) = self.handle(trigger).await {
                        self.report(kind, e)?;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        self.report("tick", e)?;
                    }
                }
                _ = shutdown.changed() => {
                    info!("engine shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    fn report(&self, context: &str, e: EngineError) -> EngineResult<()> {
        if e.is_fatal() {
            error!(context, error = %e, "invariant violated, stopping engine");
            return Err(e);
        }
        warn!(context, error = %e, "operation failed");
        Ok(())
    }
}

/// Import the rewritten artifact and start the lab; a warm lab is only
/// started. A lab that imported but failed to start is stopped again.
async fn instantiate_lab(
    catalog: &DefinitionCatalog,
    orchestrator: &dyn LabOrchestrator,
    instance: &LabletInstance,
) -> EngineResult<String> {
    if let Some(warm) = &instance.warm_lab {
        orchestrator.start(&warm.lab_id).await?;
        return Ok(warm.lab_id.clone());
    }

    let worker_id = instance
        .worker_id
        .as_deref()
        .ok_or_else(|| EngineError::Unbound(instance.id.clone()))?;
    let def = catalog
        .get(&instance.definition)?
        .ok_or_else(|| EngineError::UnknownDefinition(instance.definition.to_string()))?;
    let content = catalog.artifact(&def).await?;
    let rewritten = rewrite_artifact(&content, &instance.allocated_ports)?;

    let lab_id = orchestrator.import(worker_id, &rewritten).await?;
    if let Err(e) = orchestrator.start(&lab_id).await {
        if let Err(stop) = orchestrator.stop(&lab_id).await {
            warn!(lab = %lab_id, error = %stop, "cleanup stop failed");
        }
        return Err(e.into());
    }
    info!(instance = %instance.id, worker = %worker_id, lab = %lab_id, "lab imported and started");
    Ok(lab_id)
}
