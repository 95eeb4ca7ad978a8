//! Worker fleet: in-memory registry of workers and their status.

use std::collections::BTreeMap;
use std::sync::RwLock;

use tracing::info;

use lablet_core::{Worker, WorkerId, WorkerStatus};

use crate::error::{CapacityError, CapacityResult};

/// Registry of known workers, ordered by id.
#[derive(Default)]
pub struct WorkerFleet {
    workers: RwLock<BTreeMap<WorkerId, Worker>>,
}

impl WorkerFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, worker: Worker) -> CapacityResult<()> {
        let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
        if workers.contains_key(&worker.id) {
            return Err(CapacityError::WorkerExists(worker.id));
        }
        info!(
            worker = %worker.id,
            template = %worker.template_id,
            license = %worker.license_type,
            status = %worker.status,
            "worker registered"
        );
        workers.insert(worker.id.clone(), worker);
        Ok(())
    }

    pub fn get(&self, worker_id: &str) -> Option<Worker> {
        self.workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(worker_id)
            .cloned()
    }

    /// All workers in id order.
    pub fn list(&self) -> Vec<Worker> {
        self.workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn with_status(&self, status: WorkerStatus) -> Vec<Worker> {
        self.list()
            .into_iter()
            .filter(|w| w.status == status)
            .collect()
    }

    /// Update a worker's status, returning the updated record and the
    /// status it had before.
    pub fn set_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        now: u64,
    ) -> CapacityResult<(Worker, WorkerStatus)> {
        let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| CapacityError::UnknownWorker(worker_id.to_string()))?;
        let previous = worker.status;
        if previous != status {
            worker.status = status;
            worker.status_since = now;
            info!(worker = %worker_id, from = %previous, to = %status, "worker status changed");
        }
        Ok((worker.clone(), previous))
    }

    pub fn remove(&self, worker_id: &str) -> Option<Worker> {
        self.workers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(worker_id)
    }

    pub fn len(&self) -> usize {
        self.workers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
