//! Scaling controller: worker supply against near-term demand.
//!
//! Scale-up is event driven: the engine hands over every [`UnmetDemand`]
//! it gets back from the scheduler. Scale-down is a periodic sweep.
//! Provider calls happen outside every lock and are retried with
//! exponential backoff; the controller is meant to be driven from a
//! spawned task so the scheduling loop never waits on a provider.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use lablet_capacity::WorkerFleet;
use lablet_core::{
    Capacity, CapacityProvider, Clock, CollaboratorError, CollaboratorResult, DomainEvent, EventSink,
    ReservationId, ScalingAction, ScalingDecision, ScalingPolicy, ScalingReason, Worker,
    WorkerId, WorkerStatus, WorkerTemplate,
};
use lablet_lifecycle::LifecycleStateMachine;
use lablet_placement::shape_fits;
use lablet_scheduler::{PlacementExecutor, UnmetDemand};
use lablet_state::StateStore;

use crate::error::{AutoscaleError, AutoscaleResult};

pub struct ScalingController {
    fleet: Arc<WorkerFleet>,
    lifecycle: Arc<LifecycleStateMachine>,
    provider: Arc<dyn CapacityProvider>,
    sink: Arc<dyn EventSink>,
    state: StateStore,
    clock: Arc<dyn Clock>,
    /// Per-worker gate shared with placement commits.
    executor: Arc<PlacementExecutor>,
    templates: Vec<WorkerTemplate>,
    policy: ScalingPolicy,
    /// Reservations with a scale-up in flight, and the worker promised
    /// to them (`None` while a provision call has not returned).
    outstanding: Mutex<HashMap<ReservationId, Option<WorkerId>>>,
    /// Last time each worker was seen hosting work.
    busy_at: Mutex<HashMap<WorkerId, u64>>,
    next_decision: AtomicU64,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScalingController {
    pub fn new(
        fleet: Arc<WorkerFleet>,
        lifecycle: Arc<LifecycleStateMachine>,
        provider: Arc<dyn CapacityProvider>,
        sink: Arc<dyn EventSink>,
        state: StateStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let executor = Arc::new(PlacementExecutor::new(
            fleet.clone(),
            lifecycle.ledger().clone(),
            lifecycle.ports().clone(),
        ));
        Self {
            fleet,
            lifecycle,
            provider,
            sink,
            state,
            clock,
            executor,
            templates: Vec::new(),
            policy: ScalingPolicy::default(),
            outstanding: Mutex::new(HashMap::new()),
            busy_at: Mutex::new(HashMap::new()),
            next_decision: AtomicU64::new(1),
        }
    }

    /// Templates available for provisioning. Kept smallest first.
    pub fn with_templates(mut self, mut templates: Vec<WorkerTemplate>) -> Self {
        templates.sort_by(|a, b| {
            shape_key(&a.capacity)
                .cmp(&shape_key(&b.capacity))
                .then_with(|| a.id.cmp(&b.id))
        });
        self.templates = templates;
        self
    }

    /// Share the scheduler's executor so scale-down cannot stop a worker
    /// while a placement commits against it.
    pub fn with_executor(mut self, executor: Arc<PlacementExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_policy(mut self, policy: ScalingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    /// Reservations that currently have a scale-up in flight.
    pub fn outstanding(&self) -> usize {
        guard(&self.outstanding).len()
    }

    /// Drop the scale-up bookkeeping for a reservation that was placed,
    /// cancelled or expired.
    pub fn settle(&self, reservation_id: &str) {
        guard(&self.outstanding).remove(reservation_id);
    }

    // ── Scale-up ───────────────────────────────────────────────────

    /// React to a reservation the scheduler could not place.
    ///
    /// Acts only when the reservation starts within the lookahead horizon
    /// or the queue is deeper than its threshold. A STOPPED worker of a
    /// fitting shape is restarted in preference to provisioning; otherwise
    /// the smallest template that fits is provisioned. At most one
    /// scale-up is in flight per reservation.
    pub async fn on_unmet_demand(
        &self,
        unmet: &UnmetDemand,
        queue_depth: usize,
    ) -> AutoscaleResult<Option<ScalingDecision>> {
        let now = self.clock.now();
        let reason = if unmet.timeslot.start <= now.saturating_add(self.policy.lookahead_secs) {
            ScalingReason::UnmetDemand {
                reservation_id: unmet.reservation_id.clone(),
            }
        } else if queue_depth > self.policy.queue_depth_threshold {
            ScalingReason::QueueDepth {
                depth: queue_depth,
                threshold: self.policy.queue_depth_threshold,
            }
        } else {
            debug!(
                reservation = %unmet.reservation_id,
                start = unmet.timeslot.start,
                "unmet demand outside lookahead, not scaling"
            );
            return Ok(None);
        };

        let Some(plan) = self.plan_scale_up(unmet) else {
            return Ok(None);
        };

        let outcome = match &plan {
            ScaleUp::Restart(worker) => self.restart(reason, worker).await,
            ScaleUp::Provision(template) => self.provision(reason, template).await,
        };
        if outcome.is_err() {
            self.settle(&unmet.reservation_id);
        }
        outcome.map(Some)
    }

    /// Pick a scale-up action and mark the reservation as outstanding in
    /// one step, so two callers never claim the same stopped worker.
    fn plan_scale_up(&self, unmet: &UnmetDemand) -> Option<ScaleUp> {
        let mut outstanding = guard(&self.outstanding);
        if outstanding.contains_key(&unmet.reservation_id) {
            debug!(reservation = %unmet.reservation_id, "scale-up already in flight");
            return None;
        }

        let req = &unmet.requirements;
        let mut stopped: Vec<Worker> = self
            .fleet
            .with_status(WorkerStatus::Stopped)
            .into_iter()
            .filter(|w| {
                unmet
                    .pinned_worker
                    .as_deref()
                    .is_none_or(|pinned| pinned == w.id)
            })
            .filter(|w| !outstanding.values().any(|t| t.as_deref() == Some(w.id.as_str())))
            .filter(|w| {
                shape_fits(
                    w.license_type,
                    &w.capacity,
                    w.nested_virt,
                    &w.port_range,
                    &w.image,
                    req,
                )
            })
            .collect();
        stopped.sort_by(|a, b| {
            shape_key(&a.capacity)
                .cmp(&shape_key(&b.capacity))
                .then_with(|| a.id.cmp(&b.id))
        });

        if let Some(worker) = stopped.into_iter().next() {
            outstanding.insert(unmet.reservation_id.clone(), Some(worker.id.clone()));
            return Some(ScaleUp::Restart(worker));
        }

        if unmet.pinned_worker.is_some() {
            debug!(reservation = %unmet.reservation_id, "pinned worker is not restartable");
            return None;
        }

        let template = self.templates.iter().find(|t| {
            shape_fits(
                t.license_type,
                &t.capacity,
                t.nested_virt,
                &t.port_range,
                &t.image,
                req,
            )
        });
        match template {
            Some(template) => {
                outstanding.insert(unmet.reservation_id.clone(), None);
                Some(ScaleUp::Provision(template.clone()))
            }
            None => {
                warn!(
                    reservation = %unmet.reservation_id,
                    definition = %unmet.definition,
                    "no worker template can host this definition"
                );
                None
            }
        }
    }

    async fn provision(
        &self,
        reason: ScalingReason,
        template: &WorkerTemplate,
    ) -> AutoscaleResult<ScalingDecision> {
        let reservation = match &reason {
            ScalingReason::UnmetDemand { reservation_id } => Some(reservation_id.clone()),
            _ => None,
        };
        let decision = self
            .decide(reason, ScalingAction::Provision, None, Some(template.id.clone()))
            .await?;

        let worker_id = self
            .with_retry(&decision, || self.provider.provision(template))
            .await?;

        let worker = template.instantiate(&worker_id, self.clock.now());
        self.state.put_worker(&worker)?;
        self.fleet.register(worker.clone())?;
        self.lifecycle
            .ledger()
            .register_worker(&worker.id, worker.capacity)?;
        self.lifecycle
            .ports()
            .register_worker(&worker.id, worker.port_range)?;
        info!(
            decision = %decision.id,
            worker = %worker.id,
            template = %template.id,
            "worker provisioned"
        );

        if let Some(reservation_id) = reservation {
            let mut outstanding = guard(&self.outstanding);
            if let Some(target) = outstanding.get_mut(&reservation_id) {
                *target = Some(worker.id.clone());
            }
        }
        Ok(decision)
    }

    async fn restart(&self, reason: ScalingReason, worker: &Worker) -> AutoscaleResult<ScalingDecision> {
        let decision = self
            .decide(
                reason,
                ScalingAction::Start,
                Some(worker.id.clone()),
                Some(worker.template_id.clone()),
            )
            .await?;

        self.with_retry(&decision, || self.provider.start(&worker.id))
            .await?;
        self.apply_worker_status(&worker.id, WorkerStatus::Provisioning)
            .await?;
        info!(decision = %decision.id, worker = %worker.id, "stopped worker restarting");
        Ok(decision)
    }

    // ── Scale-down ─────────────────────────────────────────────────

    /// Stop idle RUNNING workers and terminate long-idle STOPPED ones.
    ///
    /// A RUNNING worker is stopped once it has hosted no non-terminal
    /// instance for the stop grace period; SCHEDULED instances count as
    /// hosted work, so upcoming reservations keep their worker. Workers
    /// mid-transition are never touched. Provider failures are logged
    /// and the sweep moves on.
    ///
    /// A worker is marked STOPPING under its placement gate, after
    /// checking it still holds no lease, and before the provider is
    /// called. If the provider gives up it goes back to RUNNING.
    pub async fn scale_down_sweep(&self) -> AutoscaleResult<Vec<ScalingDecision>> {
        let now = self.clock.now();
        let mut decisions = Vec::new();

        for worker in self.fleet.list() {
            if worker.status.is_transitioning() || self.is_promised(&worker.id) {
                continue;
            }
            let bound = self.lifecycle.bound_to(&worker.id);
            if !bound.is_empty() {
                guard(&self.busy_at).insert(worker.id.clone(), now);
                continue;
            }
            let idle_since = guard(&self.busy_at)
                .get(&worker.id)
                .copied()
                .unwrap_or(0)
                .max(worker.status_since);
            let idle_secs = now.saturating_sub(idle_since);

            let outcome = match worker.status {
                WorkerStatus::Running if idle_secs >= self.policy.stop_grace_secs => {
                    self.stop(&worker, idle_secs).await
                }
                WorkerStatus::Stopped if idle_secs >= self.policy.retention_secs => {
                    self.terminate(&worker, idle_secs).await.map(Some)
                }
                _ => continue,
            };
            match outcome {
                Ok(Some(decision)) => decisions.push(decision),
                Ok(None) => {}
                Err(AutoscaleError::ProvisioningFailure { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        if !decisions.is_empty() {
            info!(count = decisions.len(), "scale-down sweep finished");
        }
        Ok(decisions)
    }

    async fn stop(
        &self,
        worker: &Worker,
        idle_secs: u64,
    ) -> AutoscaleResult<Option<ScalingDecision>> {
        let now = self.clock.now();
        let claimed = self
            .executor
            .exclusive(&worker.id, || -> AutoscaleResult<Option<(Worker, WorkerStatus)>> {
                let running = self
                    .fleet
                    .get(&worker.id)
                    .is_some_and(|w| w.status == WorkerStatus::Running);
                let leases = self.lifecycle.ledger().snapshot(&worker.id)?.active_leases;
                if !running || leases > 0 || !self.lifecycle.bound_to(&worker.id).is_empty() {
                    return Ok(None);
                }
                Ok(Some(self.fleet.set_status(&worker.id, WorkerStatus::Stopping, now)?))
            });
        let Some((stopping, previous)) = claimed? else {
            debug!(worker = %worker.id, "worker picked up work, not stopping");
            guard(&self.busy_at).insert(worker.id.clone(), now);
            return Ok(None);
        };
        self.state.put_worker(&stopping)?;
        self.publish(DomainEvent::WorkerStatusChanged {
            worker_id: worker.id.clone(),
            from: previous,
            to: WorkerStatus::Stopping,
            at: now,
        })
        .await;

        let decision = self
            .decide(
                ScalingReason::Idle { idle_secs },
                ScalingAction::Stop,
                Some(worker.id.clone()),
                Some(worker.template_id.clone()),
            )
            .await?;
        if let Err(e) = self.with_retry(&decision, || self.provider.stop(&worker.id)).await {
            warn!(worker = %worker.id, "stop abandoned, worker back to RUNNING");
            self.apply_worker_status(&worker.id, WorkerStatus::Running)
                .await?;
            return Err(e);
        }
        Ok(Some(decision))
    }

    async fn terminate(&self, worker: &Worker, idle_secs: u64) -> AutoscaleResult<ScalingDecision> {
        let decision = self
            .decide(
                ScalingReason::RetentionExpired { idle_secs },
                ScalingAction::Terminate,
                Some(worker.id.clone()),
                Some(worker.template_id.clone()),
            )
            .await?;
        self.with_retry(&decision, || self.provider.terminate(&worker.id))
            .await?;
        self.apply_worker_status(&worker.id, WorkerStatus::Terminated)
            .await?;
        Ok(decision)
    }

    // ── Worker status ──────────────────────────────────────────────

    /// Record a worker status change reported by the provider or caused
    /// by a scaling action.
    ///
    /// A worker that reaches RUNNING fulfils any scale-up promised on it.
    /// A TERMINATED worker is removed from the fleet, the ledger, the
    /// port allocator and the store.
    pub async fn apply_worker_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> AutoscaleResult<Worker> {
        let now = self.clock.now();
        let (worker, previous) = self.fleet.set_status(worker_id, status, now)?;

        match status {
            WorkerStatus::Terminated => {
                self.lifecycle.ledger().deregister_worker(worker_id)?;
                self.lifecycle.ports().deregister_worker(worker_id)?;
                self.fleet.remove(worker_id);
                self.state.delete_worker(worker_id)?;
                guard(&self.busy_at).remove(worker_id);
                info!(worker = %worker_id, "worker removed from fleet");
            }
            WorkerStatus::Running => {
                guard(&self.outstanding).retain(|_, target| target.as_deref() != Some(worker_id));
                self.state.put_worker(&worker)?;
            }
            _ => self.state.put_worker(&worker)?,
        }

        if previous != status {
            self.publish(DomainEvent::WorkerStatusChanged {
                worker_id: worker_id.to_string(),
                from: previous,
                to: status,
                at: now,
            })
            .await;
        }
        Ok(worker)
    }

    // ── Internals ──────────────────────────────────────────────────

    fn is_promised(&self, worker_id: &str) -> bool {
        guard(&self.outstanding)
            .values()
            .any(|t| t.as_deref() == Some(worker_id))
    }

    /// Persist and publish a decision. Always runs before the provider
    /// call it describes.
    async fn decide(
        &self,
        reason: ScalingReason,
        action: ScalingAction,
        worker_id: Option<WorkerId>,
        template_id: Option<String>,
    ) -> AutoscaleResult<ScalingDecision> {
        let at = self.clock.now();
        let seq = self.next_decision.fetch_add(1, Ordering::Relaxed);
        let decision = ScalingDecision {
            id: format!("dec-{at}-{seq}"),
            at,
            reason,
            action,
            worker_id,
            template_id,
        };
        self.state.record_scaling_decision(&decision)?;
        info!(
            decision = %decision.id,
            action = %decision.action,
            reason = %decision.reason,
            worker = ?decision.worker_id,
            template = ?decision.template_id,
            "scaling decision"
        );
        self.publish(DomainEvent::ScalingDecided {
            decision_id: decision.id.clone(),
            reason: decision.reason.clone(),
            action: decision.action,
            worker_id: decision.worker_id.clone(),
            template_id: decision.template_id.clone(),
            at,
        })
        .await;
        Ok(decision)
    }

    /// Run a provider call, retrying with `backoff * 2^n` between attempts.
    async fn with_retry<T, F, Fut>(&self, decision: &ScalingDecision, mut call: F) -> AutoscaleResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CollaboratorResult<T>>,
    {
        let attempts = self.policy.provision_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    let delay = self
                        .policy
                        .provision_backoff
                        .saturating_mul(2u32.saturating_pow(attempt - 1));
                    warn!(
                        decision = %decision.id,
                        attempt,
                        error = %e,
                        retry_in = ?delay,
                        "provider call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(self.give_up(decision, attempt, e).await),
            }
        }
    }

    async fn give_up(
        &self,
        decision: &ScalingDecision,
        attempts: u32,
        source: CollaboratorError,
    ) -> AutoscaleError {
        error!(
            decision = %decision.id,
            action = %decision.action,
            attempts,
            error = %source,
            "provider call failed, giving up"
        );
        self.publish(DomainEvent::ProvisioningFailed {
            decision_id: decision.id.clone(),
            template_id: decision.template_id.clone(),
            worker_id: decision.worker_id.clone(),
            attempts,
            error: source.to_string(),
            at: self.clock.now(),
        })
        .await;
        AutoscaleError::ProvisioningFailure {
            decision_id: decision.id.clone(),
            attempts,
            source,
        }
    }

    async fn publish(&self, event: DomainEvent) {
        let kind = event.kind();
        if let Err(e) = self.sink.publish(event).await {
            warn!(%kind, error = %e, "failed to publish event");
        }
    }
}

enum ScaleUp {
    Restart(Worker),
    Provision(WorkerTemplate),
}

fn shape_key(c: &Capacity) -> (u32, u32, u32, u32) {
    (c.cpu_cores, c.memory_gb, c.storage_gb, c.nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use lablet_capacity::{CapacityError, CapacityLedger, PortAllocator};
    use lablet_core::{
        DefinitionRef, LicenseType, ManualClock, PortRange, Reservation, Timeslot,
    };
    use lablet_placement::Requirements;
    use lablet_scheduler::Shortfall;

    #[derive(Default)]
    struct FakeProvider {
        calls: Mutex<Vec<String>>,
        failures_left: Mutex<u32>,
        next_id: AtomicU64,
    }

    impl FakeProvider {
        fn failing(times: u32) -> Self {
            let provider = Self::default();
            *provider.failures_left.lock().unwrap() = times;
            provider
        }

        fn record(&self, call: String) -> CollaboratorResult<()> {
            self.calls.lock().unwrap().push(call);
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(CollaboratorError::call("provider", "quota exceeded"));
            }
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CapacityProvider for FakeProvider {
        async fn provision(&self, template: &WorkerTemplate) -> CollaboratorResult<WorkerId> {
            self.record(format!("provision {}", template.id))?;
            let n = self.next_id.fetch_add(1, Ordering::Relaxed);
            Ok(format!("w-new-{n}"))
        }
        async fn start(&self, worker_id: &str) -> CollaboratorResult<()> {
            self.record(format!("start {worker_id}"))
        }
        async fn stop(&self, worker_id: &str) -> CollaboratorResult<()> {
            self.record(format!("stop {worker_id}"))
        }
        async fn terminate(&self, worker_id: &str) -> CollaboratorResult<()> {
            self.record(format!("terminate {worker_id}"))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<DomainEvent>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn publish(&self, event: DomainEvent) -> CollaboratorResult<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    impl RecordingSink {
        fn kinds(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().iter().map(|e| e.kind()).collect()
        }
    }

    struct Fixture {
        controller: ScalingController,
        fleet: Arc<WorkerFleet>,
        lifecycle: Arc<LifecycleStateMachine>,
        provider: Arc<FakeProvider>,
        sink: Arc<RecordingSink>,
        state: StateStore,
        clock: Arc<ManualClock>,
    }

    fn template(id: &str, cpu: u32) -> WorkerTemplate {
        WorkerTemplate {
            id: id.to_string(),
            license_type: LicenseType::Enterprise,
            capacity: Capacity::new(cpu, cpu * 4, 500, 100),
            nested_virt: false,
            port_range: PortRange::new(2000, 2099),
            image: "ami-cml".to_string(),
        }
    }

    fn setup(provider: FakeProvider) -> Fixture {
        let fleet = Arc::new(WorkerFleet::new());
        let state = StateStore::open_in_memory().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let clock = Arc::new(ManualClock::new(10_000));
        let provider = Arc::new(provider);
        let lifecycle = Arc::new(LifecycleStateMachine::new(
            Arc::new(CapacityLedger::new()),
            Arc::new(PortAllocator::new()),
            state.clone(),
            sink.clone(),
            clock.clone(),
        ));
        let controller = ScalingController::new(
            fleet.clone(),
            lifecycle.clone(),
            provider.clone(),
            sink.clone(),
            state.clone(),
            clock.clone(),
        )
        .with_templates(vec![template("large", 64), template("small", 16)])
        .with_policy(ScalingPolicy {
            provision_backoff: Duration::from_millis(1),
            ..ScalingPolicy::default()
        });
        Fixture {
            controller,
            fleet,
            lifecycle,
            provider,
            sink,
            state,
            clock,
        }
    }

    fn add_worker(f: &Fixture, id: &str, status: WorkerStatus, cpu: u32) {
        let mut worker = template("small", cpu).instantiate(id, f.clock.now());
        worker.status = status;
        f.lifecycle
            .ledger()
            .register_worker(id, worker.capacity)
            .unwrap();
        f.lifecycle
            .ports()
            .register_worker(id, worker.port_range)
            .unwrap();
        f.fleet.register(worker).unwrap();
    }

    fn unmet(f: &Fixture, id: &str, start_in: u64, cpu: u32) -> UnmetDemand {
        let start = f.clock.now() + start_in;
        UnmetDemand {
            reservation_id: id.to_string(),
            instance_id: format!("inst-{id}"),
            definition: DefinitionRef::new("ccna", semver::Version::new(1, 0, 0)),
            timeslot: Timeslot::new(start, start + 3600),
            requirements: Requirements {
                license_affinity: [LicenseType::Enterprise].into_iter().collect(),
                demand: Capacity::new(cpu, 8, 50, 5),
                nested_virt: false,
                port_count: 2,
                image_pattern: None,
            },
            shortfall: Shortfall::NoEligibleWorker,
            pinned_worker: None,
        }
    }

    #[tokio::test]
    async fn provisions_smallest_fitting_template() {
        let f = setup(FakeProvider::default());
        let decision = f
            .controller
            .on_unmet_demand(&unmet(&f, "r1", 60, 8), 1)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(decision.action, ScalingAction::Provision);
        assert_eq!(decision.template_id.as_deref(), Some("small"));
        assert_eq!(f.provider.calls(), vec!["provision small"]);

        let worker = f.fleet.get("w-new-0").unwrap();
        assert_eq!(worker.status, WorkerStatus::Provisioning);
        assert!(f.lifecycle.ledger().contains("w-new-0"));
        assert!(f.state.get_worker("w-new-0").unwrap().is_some());
    }

    #[tokio::test]
    async fn larger_demand_picks_larger_template() {
        let f = setup(FakeProvider::default());
        let decision = f
            .controller
            .on_unmet_demand(&unmet(&f, "r1", 60, 32), 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decision.template_id.as_deref(), Some("large"));
    }

    #[tokio::test]
    async fn decision_is_recorded_before_provider_call() {
        let f = setup(FakeProvider::failing(u32::MAX));
        let err = f
            .controller
            .on_unmet_demand(&unmet(&f, "r1", 60, 8), 1)
            .await
            .unwrap_err();

        assert!(matches!(err, AutoscaleError::ProvisioningFailure { attempts: 3, .. }));
        assert_eq!(f.provider.calls().len(), 3);
        assert_eq!(f.state.list_scaling_decisions(10).unwrap().len(), 1);
        assert_eq!(
            f.sink.kinds(),
            vec!["lablet.scaling.decided", "lablet.scaling.provisioning_failed"]
        );
        // A failed scale-up may be retried on the next sweep.
        assert_eq!(f.controller.outstanding(), 0);
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let f = setup(FakeProvider::failing(2));
        let decision = f
            .controller
            .on_unmet_demand(&unmet(&f, "r1", 60, 8), 1)
            .await
            .unwrap();
        assert!(decision.is_some());
        assert_eq!(f.provider.calls().len(), 3);
        assert_eq!(f.fleet.len(), 1);
    }

    #[tokio::test]
    async fn demand_beyond_lookahead_waits() {
        let f = setup(FakeProvider::default());
        let far = unmet(&f, "r1", 24 * 3600, 8);
        assert!(f.controller.on_unmet_demand(&far, 1).await.unwrap().is_none());
        assert!(f.provider.calls().is_empty());

        // A deep queue scales regardless of the horizon.
        let decision = f.controller.on_unmet_demand(&far, 11).await.unwrap().unwrap();
        assert!(matches!(decision.reason, ScalingReason::QueueDepth { depth: 11, .. }));
    }

    #[tokio::test]
    async fn one_scale_up_per_reservation() {
        let f = setup(FakeProvider::default());
        let demand = unmet(&f, "r1", 60, 8);
        assert!(f.controller.on_unmet_demand(&demand, 1).await.unwrap().is_some());
        assert!(f.controller.on_unmet_demand(&demand, 1).await.unwrap().is_none());
        assert_eq!(f.provider.calls().len(), 1);

        // Once the worker is up the promise is fulfilled.
        f.controller
            .apply_worker_status("w-new-0", WorkerStatus::Running)
            .await
            .unwrap();
        assert_eq!(f.controller.outstanding(), 0);
    }

    #[tokio::test]
    async fn stopped_worker_is_restarted_before_provisioning() {
        let f = setup(FakeProvider::default());
        add_worker(&f, "w-stopped", WorkerStatus::Stopped, 16);

        let decision = f
            .controller
            .on_unmet_demand(&unmet(&f, "r1", 60, 8), 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decision.action, ScalingAction::Start);
        assert_eq!(f.provider.calls(), vec!["start w-stopped"]);
        assert_eq!(
            f.fleet.get("w-stopped").unwrap().status,
            WorkerStatus::Provisioning
        );

        // The second reservation cannot claim the same worker.
        let decision = f
            .controller
            .on_unmet_demand(&unmet(&f, "r2", 60, 8), 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decision.action, ScalingAction::Provision);
    }

    #[tokio::test]
    async fn no_template_fits() {
        let f = setup(FakeProvider::default());
        assert!(f
            .controller
            .on_unmet_demand(&unmet(&f, "r1", 60, 512), 1)
            .await
            .unwrap()
            .is_none());
        assert_eq!(f.controller.outstanding(), 0);
    }

    #[tokio::test]
    async fn idle_worker_is_stopped_after_grace() {
        let f = setup(FakeProvider::default());
        add_worker(&f, "w1", WorkerStatus::Running, 16);

        f.clock.advance(60);
        assert!(f.controller.scale_down_sweep().await.unwrap().is_empty());

        f.clock.advance(300);
        let decisions = f.controller.scale_down_sweep().await.unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].action, ScalingAction::Stop);
        assert_eq!(f.fleet.get("w1").unwrap().status, WorkerStatus::Stopping);

        // Mid-transition workers are left alone.
        assert!(f.controller.scale_down_sweep().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn busy_worker_is_not_stopped() {
        let f = setup(FakeProvider::default());
        add_worker(&f, "w1", WorkerStatus::Running, 16);

        let reservation = Reservation {
            id: "r1".to_string(),
            definition: DefinitionRef::new("ccna", semver::Version::new(1, 0, 0)),
            timeslot: Timeslot::new(20_000, 23_600),
            owner_id: "alice".to_string(),
            priority: 0,
            warm_lab: None,
        };
        f.lifecycle.create("inst-r1", &reservation).await.unwrap();
        let lease = f
            .lifecycle
            .ledger()
            .reserve("w1", Capacity::new(2, 2, 2, 2))
            .unwrap();
        let ports = f.lifecycle.ports().allocate("w1", "inst-r1", 1).unwrap();
        f.lifecycle.bind("inst-r1", lease, ports).await.unwrap();

        f.clock.advance(3600);
        assert!(f.controller.scale_down_sweep().await.unwrap().is_empty());
        assert!(f.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn stopped_worker_terminated_after_retention() {
        let f = setup(FakeProvider::default());
        add_worker(&f, "w1", WorkerStatus::Stopped, 16);
        f.state
            .put_worker(&f.fleet.get("w1").unwrap())
            .unwrap();

        f.clock.advance(3600);
        assert!(f.controller.scale_down_sweep().await.unwrap().is_empty());

        f.clock.advance(2 * 3600);
        let decisions = f.controller.scale_down_sweep().await.unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].action, ScalingAction::Terminate);
        assert!(f.fleet.get("w1").is_none());
        assert!(!f.lifecycle.ledger().contains("w1"));
        assert!(f.state.get_worker("w1").unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_stop_does_not_abort_sweep() {
        let f = setup(FakeProvider::failing(3));
        add_worker(&f, "w1", WorkerStatus::Running, 16);
        add_worker(&f, "w2", WorkerStatus::Running, 16);

        f.clock.advance(600);
        let decisions = f.controller.scale_down_sweep().await.unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].worker_id.as_deref(), Some("w2"));
        assert_eq!(f.fleet.get("w1").unwrap().status, WorkerStatus::Running);
    }

    /// Provider whose stop call blocks until released.
    #[derive(Default)]
    struct GatedProvider {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl CapacityProvider for GatedProvider {
        async fn provision(&self, template: &WorkerTemplate) -> CollaboratorResult<WorkerId> {
            Ok(format!("{}-0", template.id))
        }
        async fn start(&self, _worker_id: &str) -> CollaboratorResult<()> {
            Ok(())
        }
        async fn stop(&self, _worker_id: &str) -> CollaboratorResult<()> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
        async fn terminate(&self, _worker_id: &str) -> CollaboratorResult<()> {
            Ok(())
        }
    }

    fn shared_executor(f: &Fixture) -> Arc<PlacementExecutor> {
        Arc::new(PlacementExecutor::new(
            f.fleet.clone(),
            f.lifecycle.ledger().clone(),
            f.lifecycle.ports().clone(),
        ))
    }

    #[tokio::test]
    async fn worker_refuses_placement_while_stop_is_in_flight() {
        let f = setup(FakeProvider::default());
        add_worker(&f, "w1", WorkerStatus::Running, 16);
        let executor = shared_executor(&f);
        let provider = Arc::new(GatedProvider::default());
        let controller = ScalingController::new(
            f.fleet.clone(),
            f.lifecycle.clone(),
            provider.clone(),
            f.sink.clone(),
            f.state.clone(),
            f.clock.clone(),
        )
        .with_executor(executor.clone());

        f.clock.advance(600);
        let during_stop = async {
            provider.entered.notified().await;
            assert_eq!(f.fleet.get("w1").unwrap().status, WorkerStatus::Stopping);
            assert_eq!(
                f.state.get_worker("w1").unwrap().unwrap().status,
                WorkerStatus::Stopping
            );
            let err = executor
                .commit("w1", "inst-r1", Capacity::new(2, 2, 2, 2), 1)
                .unwrap_err();
            assert!(matches!(err, CapacityError::WorkerNotRunning { .. }));
            provider.release.notify_one();
        };
        let (decisions, ()) = tokio::join!(controller.scale_down_sweep(), during_stop);

        assert_eq!(decisions.unwrap().len(), 1);
        assert_eq!(f.lifecycle.ledger().snapshot("w1").unwrap().active_leases, 0);
    }

    #[tokio::test]
    async fn lease_committed_before_the_gate_keeps_worker_running() {
        let f = setup(FakeProvider::default());
        add_worker(&f, "w1", WorkerStatus::Running, 16);
        let executor = shared_executor(&f);
        let controller = ScalingController::new(
            f.fleet.clone(),
            f.lifecycle.clone(),
            f.provider.clone(),
            f.sink.clone(),
            f.state.clone(),
            f.clock.clone(),
        )
        .with_executor(executor.clone());

        // Committed but not yet bound to an instance.
        executor
            .commit("w1", "inst-r1", Capacity::new(2, 2, 2, 2), 1)
            .unwrap();

        f.clock.advance(600);
        assert!(controller.scale_down_sweep().await.unwrap().is_empty());
        assert!(f.provider.calls().is_empty());
        assert_eq!(f.fleet.get("w1").unwrap().status, WorkerStatus::Running);
    }

    #[tokio::test]
    async fn abandoned_stop_restores_running() {
        let f = setup(FakeProvider::failing(u32::MAX));
        add_worker(&f, "w1", WorkerStatus::Running, 16);

        f.clock.advance(600);
        assert!(f.controller.scale_down_sweep().await.unwrap().is_empty());
        assert_eq!(f.fleet.get("w1").unwrap().status, WorkerStatus::Running);
        assert_eq!(
            f.state.get_worker("w1").unwrap().unwrap().status,
            WorkerStatus::Running
        );
        let statuses: Vec<_> = f
            .sink
            .events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                DomainEvent::WorkerStatusChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![WorkerStatus::Stopping, WorkerStatus::Running]);
    }

    #[tokio::test]
    async fn worker_status_changes_are_published() {
        let f = setup(FakeProvider::default());
        add_worker(&f, "w1", WorkerStatus::Provisioning, 16);
        f.controller
            .apply_worker_status("w1", WorkerStatus::Running)
            .await
            .unwrap();
        let events = f.sink.events.lock().unwrap().clone();
        assert!(matches!(
            events.as_slice(),
            [DomainEvent::WorkerStatusChanged {
                from: WorkerStatus::Provisioning,
                to: WorkerStatus::Running,
                ..
            }]
        ));
    }
}
