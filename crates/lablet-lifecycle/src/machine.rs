//! LifecycleStateMachine: owns every instance's state.
//!
//! All transitions go through [`transitions::plan`](crate::transitions::plan).
//! A transition is applied to a copy of the instance under the table
//! lock, written through to the store, and only then made visible;
//! events are published after the lock is released. A terminating
//! instance's lease and ports are released after its record is stored.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use lablet_capacity::{CapacityLedger, PortAllocator};
use lablet_core::{
    Clock, DomainEvent, EventSink, InstanceId, InstanceState, LabletInstance, Lease,
    PortAllocation, Reservation,
};
use lablet_state::StateStore;

use crate::error::{LifecycleError, LifecycleResult};
use crate::transitions::{Plan, Trigger, plan};

/// Result of applying a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The instance entered every state in `path`, in order.
    Applied {
        instance: LabletInstance,
        path: Vec<InstanceState>,
    },
    /// The trigger was a replay or arrived after the instance moved on.
    Ignored { instance: LabletInstance },
}

impl Outcome {
    pub fn instance(&self) -> &LabletInstance {
        match self {
            Outcome::Applied { instance, .. } | Outcome::Ignored { instance } => instance,
        }
    }

    pub fn into_instance(self) -> LabletInstance {
        match self {
            Outcome::Applied { instance, .. } | Outcome::Ignored { instance } => instance,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied { .. })
    }
}

/// Per-instance state, valid transition enforcement, and resource
/// reclamation on termination.
///
/// Terminated instances are evicted from memory; the store keeps them.
pub struct LifecycleStateMachine {
    instances: Mutex<BTreeMap<InstanceId, LabletInstance>>,
    ledger: Arc<CapacityLedger>,
    ports: Arc<PortAllocator>,
    state: StateStore,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl LifecycleStateMachine {
    pub fn new(
        ledger: Arc<CapacityLedger>,
        ports: Arc<PortAllocator>,
        state: StateStore,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            instances: Mutex::new(BTreeMap::new()),
            ledger,
            ports,
            state,
            sink,
            clock,
        }
    }

    fn table(&self) -> MutexGuard<'_, BTreeMap<InstanceId, LabletInstance>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a PENDING instance for a reservation.
    pub async fn create(
        &self,
        instance_id: &str,
        reservation: &Reservation,
    ) -> LifecycleResult<LabletInstance> {
        let now = self.clock.now();
        let instance = LabletInstance::pending(instance_id, reservation, now);
        {
            let mut table = self.table();
            if table.contains_key(instance_id) {
                return Err(LifecycleError::InstanceExists(instance_id.to_string()));
            }
            self.state.put_instance(&instance)?;
            table.insert(instance.id.clone(), instance.clone());
        }
        info!(
            instance = %instance.id,
            reservation = %reservation.id,
            definition = %reservation.definition,
            "instance created"
        );
        self.publish(vec![DomainEvent::InstanceTransitioned {
            instance_id: instance.id.clone(),
            reservation_id: instance.reservation_id.clone(),
            from: None,
            to: InstanceState::Pending,
            trigger: "submit".to_string(),
            at: now,
        }])
        .await;
        Ok(instance)
    }

    /// PENDING → SCHEDULED: record the worker binding, lease and ports.
    ///
    /// On error the caller still owns `lease` and `ports` and must
    /// release them.
    pub async fn bind(
        &self,
        instance_id: &str,
        lease: Lease,
        ports: PortAllocation,
    ) -> LifecycleResult<LabletInstance> {
        let outcome = self
            .transition(instance_id, Trigger::Bind, |instance, _| {
                if let Some(worker_id) = &instance.worker_id {
                    return Err(LifecycleError::AlreadyBound {
                        instance_id: instance.id.clone(),
                        worker_id: worker_id.clone(),
                    });
                }
                instance.worker_id = Some(lease.worker_id.clone());
                instance.lease = Some(lease);
                instance.port_allocation = Some(ports);
                Ok(())
            })
            .await?;
        match outcome {
            Outcome::Applied { instance, .. } => Ok(instance),
            Outcome::Ignored { instance } => Err(LifecycleError::InvalidTransition {
                instance_id: instance.id,
                from: instance.state,
                trigger: Trigger::Bind,
            }),
        }
    }

    /// SCHEDULED → INSTANTIATING, fixing the `logical_name → port` map.
    ///
    /// Instances with a warm lab enter through the warm activation edge.
    pub async fn instantiate(
        &self,
        instance_id: &str,
        allocated_ports: BTreeMap<String, u16>,
    ) -> LifecycleResult<Outcome> {
        let warm = self
            .get(instance_id)?
            .ok_or_else(|| LifecycleError::UnknownInstance(instance_id.to_string()))?
            .warm_lab
            .is_some();
        let trigger = if warm {
            Trigger::WarmActivate
        } else {
            Trigger::TimeslotReached
        };
        self.transition(instance_id, trigger, |instance, _| {
            if instance.allocated_ports.is_empty() {
                instance.allocated_ports = allocated_ports;
            }
            Ok(())
        })
        .await
    }

    /// INSTANTIATING → RUNNING once the lab is imported and started.
    pub async fn mark_running(&self, instance_id: &str, lab_id: &str) -> LifecycleResult<Outcome> {
        self.transition(instance_id, Trigger::ImportSucceeded, |instance, _| {
            instance.lab_id = Some(lab_id.to_string());
            Ok(())
        })
        .await
    }

    /// Apply a trigger that carries no payload.
    ///
    /// Payload triggers are refused; they enter through [`bind`](Self::bind),
    /// [`instantiate`](Self::instantiate) and [`mark_running`](Self::mark_running).
    pub async fn fire(&self, instance_id: &str, trigger: Trigger) -> LifecycleResult<Outcome> {
        if trigger.carries_payload() {
            return Err(LifecycleError::UnsupportedTrigger {
                instance_id: instance_id.to_string(),
                trigger,
            });
        }
        self.transition(instance_id, trigger, |instance, now| {
            if trigger == Trigger::Restart && now >= instance.timeslot.end {
                return Err(LifecycleError::OutsideTimeslot {
                    instance_id: instance.id.clone(),
                });
            }
            Ok(())
        })
        .await
    }

    async fn transition<F>(
        &self,
        instance_id: &str,
        trigger: Trigger,
        mutate: F,
    ) -> LifecycleResult<Outcome>
    where
        F: FnOnce(&mut LabletInstance, u64) -> LifecycleResult<()>,
    {
        let now = self.clock.now();

        let (outcome, events) = {
            let mut table = self.table();
            let Some(current) = table.get(instance_id).cloned() else {
                return match self.state.get_instance(instance_id)? {
                    Some(instance) if instance.state.is_terminal() => {
                        warn!(
                            instance = %instance_id,
                            %trigger,
                            "trigger on terminated instance ignored"
                        );
                        Ok(Outcome::Ignored { instance })
                    }
                    _ => Err(LifecycleError::UnknownInstance(instance_id.to_string())),
                };
            };

            let from = current.state;
            let path = match plan(from, trigger) {
                Plan::Apply(path) => path,
                Plan::Ignore => {
                    debug!(instance = %instance_id, state = %from, %trigger, "trigger ignored");
                    return Ok(Outcome::Ignored { instance: current });
                }
                Plan::Invalid => {
                    return Err(LifecycleError::InvalidTransition {
                        instance_id: instance_id.to_string(),
                        from,
                        trigger,
                    });
                }
            };

            let mut next = current;
            mutate(&mut next, now)?;

            let mut events = Vec::with_capacity(path.len());
            let mut reclaimed = None;
            let mut previous = from;
            for &state in &path {
                if state == InstanceState::Terminated {
                    reclaimed = Some(self.take_resources(&mut next)?);
                    next.terminated_at = Some(now);
                }
                if state == InstanceState::Running && next.started_at.is_none() {
                    next.started_at = Some(now);
                }
                next.state = state;
                next.updated_at = now;
                events.push(DomainEvent::InstanceTransitioned {
                    instance_id: next.id.clone(),
                    reservation_id: next.reservation_id.clone(),
                    from: Some(previous),
                    to: state,
                    trigger: trigger.to_string(),
                    at: now,
                });
                previous = state;
            }

            self.state.put_instance(&next)?;
            if next.state.is_terminal() {
                table.remove(instance_id);
            } else {
                table.insert(next.id.clone(), next.clone());
            }
            if let Some((lease, allocation)) = reclaimed {
                self.release(lease, allocation)?;
            }
            info!(
                instance = %instance_id,
                from = %from,
                to = %next.state,
                %trigger,
                "instance transitioned"
            );
            (Outcome::Applied { instance: next, path }, events)
        };

        self.publish(events).await;
        Ok(outcome)
    }

    /// Detach the lease and ports from a terminating instance after
    /// checking both can be released. Nothing is released here.
    fn take_resources(
        &self,
        instance: &mut LabletInstance,
    ) -> LifecycleResult<(Option<Lease>, Option<PortAllocation>)> {
        if let Some(lease) = &instance.lease {
            self.ledger.check_release(lease)?;
        }
        if let Some(allocation) = &instance.port_allocation {
            self.ports.check_release(allocation)?;
        }
        Ok((instance.lease.take(), instance.port_allocation.take()))
    }

    /// Release capacity first, then ports. Runs only once the terminated
    /// record is durable.
    fn release(
        &self,
        lease: Option<Lease>,
        allocation: Option<PortAllocation>,
    ) -> LifecycleResult<()> {
        if let Some(lease) = lease {
            self.ledger.release(&lease)?;
        }
        if let Some(allocation) = allocation {
            self.ports.release(&allocation)?;
        }
        Ok(())
    }

    async fn publish(&self, events: Vec<DomainEvent>) {
        for event in events {
            let kind = event.kind();
            if let Err(e) = self.sink.publish(event).await {
                warn!(%kind, error = %e, "failed to publish event");
            }
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn ledger(&self) -> &Arc<CapacityLedger> {
        &self.ledger
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Look up an instance, falling back to the store for terminated ones.
    pub fn get(&self, instance_id: &str) -> LifecycleResult<Option<LabletInstance>> {
        if let Some(instance) = self.table().get(instance_id) {
            return Ok(Some(instance.clone()));
        }
        Ok(self.state.get_instance(instance_id)?)
    }

    /// Every non-terminal instance, in id order.
    pub fn active(&self) -> Vec<LabletInstance> {
        self.table().values().cloned().collect()
    }

    pub fn in_state(&self, state: InstanceState) -> Vec<LabletInstance> {
        self.table()
            .values()
            .filter(|i| i.state == state)
            .cloned()
            .collect()
    }

    /// Non-terminal instances bound to a worker.
    pub fn bound_to(&self, worker_id: &str) -> Vec<LabletInstance> {
        self.table()
            .values()
            .filter(|i| i.worker_id.as_deref() == Some(worker_id))
            .cloned()
            .collect()
    }

    /// Rebuild the in-memory table from recovered instances, re-debiting
    /// their leases and re-claiming their ports. Workers must already be
    /// registered with the ledger and the allocator.
    pub fn restore(&self, instances: Vec<LabletInstance>) -> LifecycleResult<usize> {
        let mut table = self.table();
        let mut restored = 0;
        for instance in instances {
            if instance.state.is_terminal() {
                continue;
            }
            if let Some(lease) = &instance.lease {
                self.ledger.restore(lease)?;
            }
            if let Some(allocation) = &instance.port_allocation {
                self.ports.claim(allocation)?;
            }
            debug!(instance = %instance.id, state = %instance.state, "instance restored");
            table.insert(instance.id.clone(), instance);
            restored += 1;
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lablet_core::{
        Capacity, CollaboratorResult, DefinitionRef, ManualClock, PortRange, Timeslot,
    };

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
        fn transitions(&self) -> Vec<(Option<InstanceState>, InstanceState)> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    DomainEvent::InstanceTransitioned { from, to, .. } => Some((*from, *to)),
                    _ => None,
                })
                .collect()
        }
    }

    struct Fixture {
        machine: LifecycleStateMachine,
        ledger: Arc<CapacityLedger>,
        ports: Arc<PortAllocator>,
        sink: Arc<RecordingSink>,
        clock: Arc<ManualClock>,
    }

    fn setup() -> Fixture {
        let ledger = Arc::new(CapacityLedger::new());
        let ports = Arc::new(PortAllocator::new());
        ledger
            .register_worker("w1", Capacity::new(16, 64, 500, 20))
            .unwrap();
        ports.register_worker("w1", PortRange::new(2000, 2009)).unwrap();
        let sink = Arc::new(RecordingSink::default());
        let clock = Arc::new(ManualClock::new(1000));
        let machine = LifecycleStateMachine::new(
            ledger.clone(),
            ports.clone(),
            StateStore::open_in_memory().unwrap(),
            sink.clone(),
            clock.clone(),
        );
        Fixture {
            machine,
            ledger,
            ports,
            sink,
            clock,
        }
    }

    fn test_reservation(id: &str) -> Reservation {
        Reservation {
            id: id.to_string(),
            definition: DefinitionRef::new("ccna", semver::Version::new(1, 0, 0)),
            timeslot: Timeslot::new(2000, 5600),
            owner_id: "alice".to_string(),
            priority: 0,
            warm_lab: None,
        }
    }

    async fn scheduled(f: &Fixture, id: &str) -> LabletInstance {
        f.machine.create(id, &test_reservation(&format!("r-{id}"))).await.unwrap();
        let lease = f.ledger.reserve("w1", Capacity::new(4, 16, 50, 3)).unwrap();
        let alloc = f.ports.allocate("w1", id, 2).unwrap();
        f.machine.bind(id, lease, alloc).await.unwrap()
    }

    async fn running(f: &Fixture, id: &str) -> LabletInstance {
        scheduled(f, id).await;
        f.machine.instantiate(id, BTreeMap::new()).await.unwrap();
        f.machine.mark_running(id, "lab-1").await.unwrap().into_instance()
    }

    #[tokio::test]
    async fn create_emits_pending_event() {
        let f = setup();
        let inst = f.machine.create("i1", &test_reservation("r1")).await.unwrap();
        assert_eq!(inst.state, InstanceState::Pending);
        assert!(inst.worker_id.is_none());
        assert_eq!(f.sink.transitions(), vec![(None, InstanceState::Pending)]);
        assert!(matches!(
            f.machine.create("i1", &test_reservation("r1")).await,
            Err(LifecycleError::InstanceExists(_))
        ));
    }

    #[tokio::test]
    async fn bind_sets_worker_once() {
        let f = setup();
        let inst = scheduled(&f, "i1").await;
        assert_eq!(inst.state, InstanceState::Scheduled);
        assert_eq!(inst.worker_id.as_deref(), Some("w1"));
        assert_eq!(inst.ports(), &[2000, 2001]);

        let lease = f.ledger.reserve("w1", Capacity::new(1, 1, 1, 1)).unwrap();
        let alloc = f.ports.allocate("w1", "i1", 1).unwrap();
        let err = f.machine.bind("i1", lease, alloc).await.unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));
        assert_eq!(f.machine.get("i1").unwrap().unwrap().state, InstanceState::Scheduled);
    }

    #[tokio::test]
    async fn termination_releases_capacity_then_ports() {
        let f = setup();
        scheduled(&f, "i1").await;
        assert!(!f.ledger.snapshot("w1").unwrap().allocated.is_zero());

        let outcome = f.machine.fire("i1", Trigger::Cancel).await.unwrap();
        let inst = outcome.instance();
        assert_eq!(inst.state, InstanceState::Terminated);
        assert!(inst.lease.is_none() && inst.port_allocation.is_none());
        assert_eq!(inst.terminated_at, Some(1000));

        assert!(f.ledger.snapshot("w1").unwrap().allocated.is_zero());
        assert_eq!(f.ports.free_count("w1").unwrap(), 10);
        assert!(f.machine.active().is_empty());
        assert_eq!(
            f.machine.get("i1").unwrap().unwrap().state,
            InstanceState::Terminated
        );
    }

    #[tokio::test]
    async fn unreleasable_resources_block_termination() {
        let f = setup();
        let inst = scheduled(&f, "i1").await;
        let allocation = inst.port_allocation.clone().unwrap();
        // Ports freed behind the machine's back.
        f.ports.release(&allocation).unwrap();

        let err = f.machine.fire("i1", Trigger::Cancel).await.unwrap_err();
        assert!(err.is_fatal());

        let inst = f.machine.get("i1").unwrap().unwrap();
        assert_eq!(inst.state, InstanceState::Scheduled);
        assert!(inst.lease.is_some());
        assert_eq!(f.machine.active().len(), 1);
        assert_eq!(f.ledger.snapshot("w1").unwrap().active_leases, 1);
    }

    #[tokio::test]
    async fn payload_triggers_cannot_be_fired() {
        let f = setup();
        f.machine.create("i1", &test_reservation("r1")).await.unwrap();
        let before = f.sink.transitions().len();

        for trigger in [
            Trigger::Bind,
            Trigger::TimeslotReached,
            Trigger::WarmActivate,
            Trigger::ImportSucceeded,
        ] {
            let err = f.machine.fire("i1", trigger).await.unwrap_err();
            assert!(matches!(err, LifecycleError::UnsupportedTrigger { .. }));
            assert!(!err.is_fatal());
        }

        let inst = f.machine.get("i1").unwrap().unwrap();
        assert_eq!(inst.state, InstanceState::Pending);
        assert!(inst.worker_id.is_none() && inst.lease.is_none());
        assert_eq!(f.sink.transitions().len(), before);
    }

    #[tokio::test]
    async fn stale_stop_confirmation_after_restart_is_ignored() {
        let f = setup();
        running(&f, "i1").await;
        f.machine.fire("i1", Trigger::StopRequested).await.unwrap();
        f.machine.fire("i1", Trigger::WorkerConfirmedStop).await.unwrap();
        f.machine.fire("i1", Trigger::Restart).await.unwrap();

        let replay = f.machine.fire("i1", Trigger::WorkerConfirmedStop).await.unwrap();
        assert!(!replay.is_applied());
        assert_eq!(replay.instance().state, InstanceState::Running);
    }

    #[tokio::test]
    async fn invalid_transition_leaves_state_untouched() {
        let f = setup();
        f.machine.create("i1", &test_reservation("r1")).await.unwrap();
        let before = f.sink.transitions().len();

        let err = f.machine.fire("i1", Trigger::ResultsPersisted).await.unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));
        assert_eq!(f.machine.get("i1").unwrap().unwrap().state, InstanceState::Pending);
        assert_eq!(f.sink.transitions().len(), before);
    }

    #[tokio::test]
    async fn collection_completed_twice_stays_grading() {
        let f = setup();
        running(&f, "i1").await;

        let first = f.machine.fire("i1", Trigger::CollectionCompleted).await.unwrap();
        assert!(first.is_applied());
        assert_eq!(first.instance().state, InstanceState::Grading);
        let events = f.sink.transitions().len();

        let second = f.machine.fire("i1", Trigger::CollectionCompleted).await.unwrap();
        assert!(!second.is_applied());
        assert_eq!(second.instance().state, InstanceState::Grading);
        assert_eq!(f.sink.transitions().len(), events);
    }

    #[tokio::test]
    async fn one_event_per_state_entered() {
        let f = setup();
        running(&f, "i1").await;
        f.machine.fire("i1", Trigger::CollectionCompleted).await.unwrap();

        let tail: Vec<_> = f.sink.transitions().into_iter().skip(4).collect();
        assert_eq!(
            tail,
            vec![
                (Some(InstanceState::Running), InstanceState::Collecting),
                (Some(InstanceState::Collecting), InstanceState::Grading),
            ]
        );
    }

    #[tokio::test]
    async fn full_lifecycle_to_terminated() {
        let f = setup();
        let inst = running(&f, "i1").await;
        assert_eq!(inst.lab_id.as_deref(), Some("lab-1"));
        assert_eq!(inst.started_at, Some(1000));

        for trigger in [
            Trigger::StopRequested,
            Trigger::WorkerConfirmedStop,
            Trigger::ResultsPersisted,
            Trigger::CleanupCompleted,
        ] {
            f.clock.advance(10);
            f.machine.fire("i1", trigger).await.unwrap();
        }
        let inst = f.machine.get("i1").unwrap().unwrap();
        assert_eq!(inst.state, InstanceState::Terminated);
        assert_eq!(inst.worker_id.as_deref(), Some("w1"));
        assert!(f.ledger.snapshot("w1").unwrap().allocated.is_zero());

        // Replayed cleanup on an evicted instance is a no-op.
        let replay = f.machine.fire("i1", Trigger::CleanupCompleted).await.unwrap();
        assert!(!replay.is_applied());
    }

    #[tokio::test]
    async fn restart_only_within_timeslot() {
        let f = setup();
        running(&f, "i1").await;
        f.machine.fire("i1", Trigger::StopRequested).await.unwrap();
        f.machine.fire("i1", Trigger::WorkerConfirmedStop).await.unwrap();

        f.clock.set(3000);
        let restarted = f.machine.fire("i1", Trigger::Restart).await.unwrap();
        assert_eq!(restarted.instance().state, InstanceState::Running);
        assert_eq!(restarted.instance().started_at, Some(1000));

        f.machine.fire("i1", Trigger::StopRequested).await.unwrap();
        f.machine.fire("i1", Trigger::WorkerConfirmedStop).await.unwrap();
        f.clock.set(6000);
        assert!(matches!(
            f.machine.fire("i1", Trigger::Restart).await,
            Err(LifecycleError::OutsideTimeslot { .. })
        ));
    }

    #[tokio::test]
    async fn allocated_ports_fixed_at_instantiation() {
        let f = setup();
        scheduled(&f, "i1").await;
        let mapping = BTreeMap::from([("console".to_string(), 2000), ("ssh".to_string(), 2001)]);
        let outcome = f.machine.instantiate("i1", mapping.clone()).await.unwrap();
        assert_eq!(outcome.instance().state, InstanceState::Instantiating);
        assert_eq!(outcome.instance().allocated_ports, mapping);
    }

    #[tokio::test]
    async fn restore_rebuilds_table_and_resources() {
        let f = setup();
        let inst = scheduled(&f, "i1").await;

        let ledger = Arc::new(CapacityLedger::new());
        let ports = Arc::new(PortAllocator::new());
        ledger
            .register_worker("w1", Capacity::new(16, 64, 500, 20))
            .unwrap();
        ports.register_worker("w1", PortRange::new(2000, 2009)).unwrap();
        let fresh = LifecycleStateMachine::new(
            ledger.clone(),
            ports.clone(),
            StateStore::open_in_memory().unwrap(),
            Arc::new(RecordingSink::default()),
            Arc::new(ManualClock::new(1000)),
        );

        assert_eq!(fresh.restore(vec![inst]).unwrap(), 1);
        assert_eq!(fresh.bound_to("w1").len(), 1);
        assert_eq!(ports.free_count("w1").unwrap(), 8);
        assert_eq!(
            ledger.snapshot("w1").unwrap().allocated,
            Capacity::new(4, 16, 50, 3)
        );
    }
}
