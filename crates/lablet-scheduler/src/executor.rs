//! Placement executor: commits a chosen placement.
//!
//! The commit is two steps, ledger then ports, under a per-worker gate.
//! Two commits against the same worker are mutually exclusive; commits
//! against different workers run in parallel. If the port step fails
//! the ledger lease is released before the error is returned, so from
//! the caller's side the commit either fully happens or not at all.
//!
//! The worker must still be RUNNING when the gate is taken. Scale-down
//! flips a worker out of RUNNING through [`PlacementExecutor::exclusive`],
//! so a worker is never stopped under a commit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use lablet_capacity::{CapacityError, CapacityLedger, CapacityResult, PortAllocator, WorkerFleet};
use lablet_core::{Capacity, Lease, PortAllocation, WorkerId, WorkerStatus};

pub struct PlacementExecutor {
    fleet: Arc<WorkerFleet>,
    ledger: Arc<CapacityLedger>,
    ports: Arc<PortAllocator>,
    gates: Mutex<HashMap<WorkerId, Arc<Mutex<()>>>>,
}

impl PlacementExecutor {
    pub fn new(
        fleet: Arc<WorkerFleet>,
        ledger: Arc<CapacityLedger>,
        ports: Arc<PortAllocator>,
    ) -> Self {
        Self {
            fleet,
            ledger,
            ports,
            gates: Mutex::new(HashMap::new()),
        }
    }

    fn gate(&self, worker_id: &str) -> Arc<Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        gates
            .entry(worker_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Reserve `demand` and allocate `port_count` ports on one worker.
    pub fn commit(
        &self,
        worker_id: &str,
        instance_id: &str,
        demand: Capacity,
        port_count: u32,
    ) -> CapacityResult<(Lease, PortAllocation)> {
        let gate = self.gate(worker_id);
        let _held = gate.lock().unwrap_or_else(PoisonError::into_inner);

        let status = self
            .fleet
            .get(worker_id)
            .map(|w| w.status)
            .ok_or_else(|| CapacityError::UnknownWorker(worker_id.to_string()))?;
        if status != WorkerStatus::Running {
            return Err(CapacityError::WorkerNotRunning {
                worker_id: worker_id.to_string(),
                status,
            });
        }

        let lease = self.ledger.reserve(worker_id, demand)?;
        match self.ports.allocate(worker_id, instance_id, port_count) {
            Ok(allocation) => {
                debug!(
                    worker = %worker_id,
                    instance = %instance_id,
                    lease = %lease.id,
                    "placement committed"
                );
                Ok((lease, allocation))
            }
            Err(e) => {
                warn!(worker = %worker_id, instance = %instance_id, error = %e, "port step failed, rolling back lease");
                self.ledger.release(&lease)?;
                Err(e)
            }
        }
    }

    /// Undo a commit whose binding could not be recorded.
    pub fn rollback(&self, lease: &Lease, allocation: &PortAllocation) -> CapacityResult<()> {
        let gate = self.gate(&lease.worker_id);
        let _held = gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.ledger.release(lease)?;
        self.ports.release(allocation)?;
        debug!(worker = %lease.worker_id, instance = %allocation.instance_id, "placement rolled back");
        Ok(())
    }

    /// Run `f` holding a worker's gate; no commit against the worker can
    /// interleave with it. `f` must not block.
    pub fn exclusive<R>(&self, worker_id: &str, f: impl FnOnce() -> R) -> R {
        let gate = self.gate(worker_id);
        let _held = gate.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    /// Drop a worker's gate once the worker is gone.
    pub fn forget(&self, worker_id: &str) {
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(worker_id);
    }
}
