//! Port allocator: exclusive, collision-free port leases per worker.
//!
//! Each worker's pool keeps an ordered free-list plus a record of which
//! instance holds each leased port. Allocation always hands out the
//! lowest free ports, so identical inputs produce identical allocations.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, error};

use lablet_core::{InstanceId, PortAllocation, PortRange, WorkerId};

use crate::error::{CapacityError, CapacityResult};
use crate::lock;

/// Point-in-time view of one worker's ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSnapshot {
    pub worker_id: WorkerId,
    pub range: PortRange,
    pub allocated: BTreeSet<u16>,
    pub free: u32,
}

#[derive(Debug)]
struct PortPool {
    range: PortRange,
    free: BTreeSet<u16>,
    held: BTreeMap<u16, InstanceId>,
}

impl PortPool {
    fn new(range: PortRange) -> Self {
        Self {
            range,
            free: range.iter().collect(),
            held: BTreeMap::new(),
        }
    }

    /// Every port must be held by the allocation's instance, once.
    fn check_held(&self, allocation: &PortAllocation) -> CapacityResult<()> {
        let mut seen = BTreeSet::new();
        for &port in &allocation.ports {
            let holder = self.held.get(&port);
            if holder != Some(&allocation.instance_id) || !seen.insert(port) {
                error!(
                    worker = %allocation.worker_id,
                    instance = %allocation.instance_id,
                    port,
                    "release of port not held"
                );
                return Err(CapacityError::PortNotHeld {
                    worker_id: allocation.worker_id.clone(),
                    instance_id: allocation.instance_id.clone(),
                    port,
                });
            }
        }
        Ok(())
    }
}

/// Per-worker port free-lists.
#[derive(Default)]
pub struct PortAllocator {
    pools: RwLock<HashMap<WorkerId, Arc<Mutex<PortPool>>>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn pool(&self, worker_id: &str) -> CapacityResult<Arc<Mutex<PortPool>>> {
        let pools = self.pools.read().unwrap_or_else(|e| e.into_inner());
        pools
            .get(worker_id)
            .cloned()
            .ok_or_else(|| CapacityError::UnknownWorker(worker_id.to_string()))
    }

    pub fn register_worker(&self, worker_id: &str, range: PortRange) -> CapacityResult<()> {
        let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        if pools.contains_key(worker_id) {
            return Err(CapacityError::WorkerExists(worker_id.to_string()));
        }
        pools.insert(worker_id.to_string(), Arc::new(Mutex::new(PortPool::new(range))));
        debug!(worker = %worker_id, %range, "port pool created");
        Ok(())
    }

    /// Drop a worker's pool. Refused while any port is leased.
    pub fn deregister_worker(&self, worker_id: &str) -> CapacityResult<()> {
        let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        let pool = pools
            .get(worker_id)
            .ok_or_else(|| CapacityError::UnknownWorker(worker_id.to_string()))?;
        let held = lock(pool).held.len();
        if held > 0 {
            return Err(CapacityError::StillAllocated {
                worker_id: worker_id.to_string(),
                count: held,
            });
        }
        pools.remove(worker_id);
        debug!(worker = %worker_id, "port pool removed");
        Ok(())
    }

    pub fn contains(&self, worker_id: &str) -> bool {
        self.pools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(worker_id)
    }

    /// Lease the `count` lowest free ports on a worker to an instance.
    pub fn allocate(
        &self,
        worker_id: &str,
        instance_id: &str,
        count: u32,
    ) -> CapacityResult<PortAllocation> {
        let pool = self.pool(worker_id)?;
        let mut pool = lock(&pool);

        let free = pool.free.len() as u32;
        if free < count {
            return Err(CapacityError::PortExhaustion {
                worker_id: worker_id.to_string(),
                requested: count,
                free,
            });
        }

        let ports: Vec<u16> = pool.free.iter().take(count as usize).copied().collect();
        for port in &ports {
            pool.free.remove(port);
            pool.held.insert(*port, instance_id.to_string());
        }
        debug!(worker = %worker_id, instance = %instance_id, ?ports, "ports allocated");
        Ok(PortAllocation {
            worker_id: worker_id.to_string(),
            instance_id: instance_id.to_string(),
            ports,
        })
    }

    /// Return an allocation's ports to the free-list.
    ///
    /// Every port is validated before any is freed: a port this instance
    /// does not hold aborts the whole release with a fatal error.
    pub fn release(&self, allocation: &PortAllocation) -> CapacityResult<()> {
        let pool = self.pool(&allocation.worker_id)?;
        let mut pool = lock(&pool);
        pool.check_held(allocation)?;

        for port in &allocation.ports {
            pool.held.remove(port);
            pool.free.insert(*port);
        }
        debug!(
            worker = %allocation.worker_id,
            instance = %allocation.instance_id,
            ports = ?allocation.ports,
            "ports released"
        );
        Ok(())
    }

    /// Fail exactly as [`release`](Self::release) would, without releasing.
    pub fn check_release(&self, allocation: &PortAllocation) -> CapacityResult<()> {
        let pool = self.pool(&allocation.worker_id)?;
        let pool = lock(&pool);
        pool.check_held(allocation)
    }

    /// Mark a recovered allocation as held during reconciliation.
    pub fn claim(&self, allocation: &PortAllocation) -> CapacityResult<()> {
        let pool = self.pool(&allocation.worker_id)?;
        let mut pool = lock(&pool);

        let mut seen = BTreeSet::new();
        for &port in &allocation.ports {
            if !pool.range.contains(port) {
                return Err(CapacityError::PortOutOfRange {
                    worker_id: allocation.worker_id.clone(),
                    port,
                });
            }
            if !pool.free.contains(&port) || !seen.insert(port) {
                error!(worker = %allocation.worker_id, port, "recovered port already held");
                return Err(CapacityError::PortConflict {
                    worker_id: allocation.worker_id.clone(),
                    port,
                });
            }
        }

        for port in &allocation.ports {
            pool.free.remove(port);
            pool.held.insert(*port, allocation.instance_id.clone());
        }
        Ok(())
    }

    pub fn free_count(&self, worker_id: &str) -> CapacityResult<u32> {
        let pool = self.pool(worker_id)?;
        let pool = lock(&pool);
        Ok(pool.free.len() as u32)
    }

    pub fn snapshot(&self, worker_id: &str) -> CapacityResult<PortSnapshot> {
        let pool = self.pool(worker_id)?;
        let pool = lock(&pool);
        Ok(PortSnapshot {
            worker_id: worker_id.to_string(),
            range: pool.range,
            allocated: pool.held.keys().copied().collect(),
            free: pool.free.len() as u32,
        })
    }
}
