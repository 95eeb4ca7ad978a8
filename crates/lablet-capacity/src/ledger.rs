//! Capacity ledger: the single source of truth for per-worker capacity.
//!
//! Each worker has an account holding its declared capacity, the sum of
//! outstanding leases, and the leases themselves. `reserve` checks and
//! debits under the account's lock, so two concurrent reservations can
//! never both succeed against capacity only one of them fits.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, error};

use lablet_core::{Capacity, Lease, LeaseId, WorkerId};

use crate::error::{CapacityError, CapacityResult};
use crate::lock;

/// Point-in-time view of one worker's account.
///
/// May be stale by the time the caller acts on it; commits go through
/// [`CapacityLedger::reserve`], which re-checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacitySnapshot {
    pub worker_id: WorkerId,
    pub declared: Capacity,
    pub allocated: Capacity,
    pub active_leases: usize,
}

impl CapacitySnapshot {
    pub fn available(&self) -> Capacity {
        self.declared.saturating_sub(&self.allocated)
    }
}

#[derive(Debug)]
struct Account {
    declared: Capacity,
    allocated: Capacity,
    leases: HashMap<LeaseId, Capacity>,
}

impl Account {
    fn new(declared: Capacity) -> Self {
        Self {
            declared,
            allocated: Capacity::ZERO,
            leases: HashMap::new(),
        }
    }

    fn available(&self) -> Capacity {
        self.declared.saturating_sub(&self.allocated)
    }

    /// Debit `demand` if it fits; `None` leaves the account untouched.
    fn debit(&mut self, demand: &Capacity) -> Option<Capacity> {
        let allocated = self.allocated.checked_add(demand)?;
        if !allocated.fits_within(&self.declared) {
            return None;
        }
        self.allocated = allocated;
        Some(allocated)
    }
}

/// Declared vs. allocated capacity for every registered worker.
pub struct CapacityLedger {
    accounts: RwLock<HashMap<WorkerId, Arc<Mutex<Account>>>>,
    next_lease: AtomicU64,
}

impl Default for CapacityLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl CapacityLedger {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            next_lease: AtomicU64::new(1),
        }
    }

    fn account(&self, worker_id: &str) -> CapacityResult<Arc<Mutex<Account>>> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts
            .get(worker_id)
            .cloned()
            .ok_or_else(|| CapacityError::UnknownWorker(worker_id.to_string()))
    }

    /// Open an empty account for a worker.
    pub fn register_worker(&self, worker_id: &str, declared: Capacity) -> CapacityResult<()> {
        let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
        if accounts.contains_key(worker_id) {
            return Err(CapacityError::WorkerExists(worker_id.to_string()));
        }
        accounts.insert(
            worker_id.to_string(),
            Arc::new(Mutex::new(Account::new(declared))),
        );
        debug!(worker = %worker_id, %declared, "ledger account opened");
        Ok(())
    }

    /// Close a worker's account. Refused while leases are outstanding.
    pub fn deregister_worker(&self, worker_id: &str) -> CapacityResult<()> {
        let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
        let account = accounts
            .get(worker_id)
            .ok_or_else(|| CapacityError::UnknownWorker(worker_id.to_string()))?;
        let outstanding = lock(account).leases.len();
        if outstanding > 0 {
            return Err(CapacityError::StillAllocated {
                worker_id: worker_id.to_string(),
                count: outstanding,
            });
        }
        accounts.remove(worker_id);
        debug!(worker = %worker_id, "ledger account closed");
        Ok(())
    }

    pub fn contains(&self, worker_id: &str) -> bool {
        self.accounts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(worker_id)
    }

    /// Atomically check `available >= demand` on every dimension and debit.
    pub fn reserve(&self, worker_id: &str, demand: Capacity) -> CapacityResult<Lease> {
        let account = self.account(worker_id)?;
        let mut account = lock(&account);

        let available = account.available();
        if account.debit(&demand).is_none() {
            return Err(CapacityError::InsufficientCapacity {
                worker_id: worker_id.to_string(),
                requested: demand,
                available,
            });
        }

        let id = LeaseId(self.next_lease.fetch_add(1, Ordering::Relaxed));
        account.leases.insert(id, demand);
        debug!(worker = %worker_id, lease = %id, %demand, "capacity reserved");
        Ok(Lease {
            id,
            worker_id: worker_id.to_string(),
            demand,
        })
    }

    /// Credit back exactly what the lease debited.
    ///
    /// Releasing a lease twice (or one this ledger never issued) is a
    /// fatal [`CapacityError::DoubleRelease`].
    pub fn release(&self, lease: &Lease) -> CapacityResult<()> {
        let account = self.account(&lease.worker_id)?;
        let mut account = lock(&account);

        let Some(demand) = account.leases.remove(&lease.id) else {
            error!(worker = %lease.worker_id, lease = %lease.id, "double release");
            return Err(CapacityError::DoubleRelease {
                worker_id: lease.worker_id.clone(),
                lease: lease.id,
            });
        };
        account.allocated = account.allocated.saturating_sub(&demand);
        debug!(worker = %lease.worker_id, lease = %lease.id, %demand, "capacity released");
        Ok(())
    }

    /// Fail exactly as [`release`](Self::release) would, without releasing.
    pub fn check_release(&self, lease: &Lease) -> CapacityResult<()> {
        let account = self.account(&lease.worker_id)?;
        if !lock(&account).leases.contains_key(&lease.id) {
            return Err(CapacityError::DoubleRelease {
                worker_id: lease.worker_id.clone(),
                lease: lease.id,
            });
        }
        Ok(())
    }

    /// Re-debit a lease recovered from durable state during reconciliation.
    pub fn restore(&self, lease: &Lease) -> CapacityResult<()> {
        let account = self.account(&lease.worker_id)?;
        let mut account = lock(&account);

        if account.leases.contains_key(&lease.id) {
            return Err(CapacityError::DuplicateLease {
                worker_id: lease.worker_id.clone(),
                lease: lease.id,
            });
        }
        if account.debit(&lease.demand).is_none() {
            error!(worker = %lease.worker_id, lease = %lease.id, "restored lease overcommits worker");
            return Err(CapacityError::Overcommit {
                worker_id: lease.worker_id.clone(),
                lease: lease.id,
            });
        }
        account.leases.insert(lease.id, lease.demand);
        self.next_lease.fetch_max(lease.id.0 + 1, Ordering::Relaxed);
        debug!(worker = %lease.worker_id, lease = %lease.id, "lease restored");
        Ok(())
    }

    pub fn snapshot(&self, worker_id: &str) -> CapacityResult<CapacitySnapshot> {
        let account = self.account(worker_id)?;
        let account = lock(&account);
        Ok(CapacitySnapshot {
            worker_id: worker_id.to_string(),
            declared: account.declared,
            allocated: account.allocated,
            active_leases: account.leases.len(),
        })
    }

    /// Snapshots of every account, ordered by worker id.
    pub fn snapshots(&self) -> BTreeMap<WorkerId, CapacitySnapshot> {
        let accounts: Vec<_> = {
            let map = self.accounts.read().unwrap_or_else(|e| e.into_inner());
            map.iter().map(|(id, a)| (id.clone(), a.clone())).collect()
        };
        accounts
            .into_iter()
            .map(|(id, account)| {
                let account = lock(&account);
                let snapshot = CapacitySnapshot {
                    worker_id: id.clone(),
                    declared: account.declared,
                    allocated: account.allocated,
                    active_leases: account.leases.len(),
                };
                (id, snapshot)
            })
            .collect()
    }
}
