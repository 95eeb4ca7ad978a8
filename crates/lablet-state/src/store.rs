//! StateStore: redb-backed persistence for the lablet engine.
//!
//! Provides typed CRUD over definitions, workers, instances, queued
//! reservations and the scaling audit trail. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use lablet_core::{
    DefinitionRef, LabletDefinition, LabletInstance, Reservation, ScalingDecision, Worker,
};

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [DEFINITIONS, WORKERS, INSTANCES, RESERVATIONS, SCALING_DECISIONS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All values in key order.
    fn list<T: DeserializeOwned>(&self, table: Table) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn delete(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Definitions ────────────────────────────────────────────────

    /// Insert a definition version.
    pub fn put_definition(&self, def: &LabletDefinition) -> StateResult<()> {
        let key = def.reference().table_key();
        self.put(DEFINITIONS, &key, def)?;
        debug!(%key, "definition stored");
        Ok(())
    }

    pub fn get_definition(&self, reference: &DefinitionRef) -> StateResult<Option<LabletDefinition>> {
        self.get(DEFINITIONS, &reference.table_key())
    }

    pub fn list_definitions(&self) -> StateResult<Vec<LabletDefinition>> {
        self.list(DEFINITIONS)
    }

    // ── Workers ────────────────────────────────────────────────────

    /// Insert or update a worker.
    pub fn put_worker(&self, worker: &Worker) -> StateResult<()> {
        self.put(WORKERS, &worker.id, worker)
    }

    pub fn get_worker(&self, worker_id: &str) -> StateResult<Option<Worker>> {
        self.get(WORKERS, worker_id)
    }

    pub fn list_workers(&self) -> StateResult<Vec<Worker>> {
        self.list(WORKERS)
    }

    /// Delete a worker by ID. Returns true if it existed.
    pub fn delete_worker(&self, worker_id: &str) -> StateResult<bool> {
        self.delete(WORKERS, worker_id)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or update an instance.
    pub fn put_instance(&self, instance: &LabletInstance) -> StateResult<()> {
        self.put(INSTANCES, &instance.id, instance)
    }

    pub fn get_instance(&self, instance_id: &str) -> StateResult<Option<LabletInstance>> {
        self.get(INSTANCES, instance_id)
    }

    pub fn list_instances(&self) -> StateResult<Vec<LabletInstance>> {
        self.list(INSTANCES)
    }

    /// Instances that have not reached TERMINATED.
    pub fn list_active_instances(&self) -> StateResult<Vec<LabletInstance>> {
        Ok(self
            .list_instances()?
            .into_iter()
            .filter(|i: &LabletInstance| !i.state.is_terminal())
            .collect())
    }

    pub fn delete_instance(&self, instance_id: &str) -> StateResult<bool> {
        self.delete(INSTANCES, instance_id)
    }

    // ── Queued reservations ────────────────────────────────────────

    pub fn put_reservation(&self, reservation: &Reservation) -> StateResult<()> {
        self.put(RESERVATIONS, &reservation.id, reservation)
    }

    pub fn get_reservation(&self, reservation_id: &str) -> StateResult<Option<Reservation>> {
        self.get(RESERVATIONS, reservation_id)
    }

    pub fn list_reservations(&self) -> StateResult<Vec<Reservation>> {
        self.list(RESERVATIONS)
    }

    pub fn delete_reservation(&self, reservation_id: &str) -> StateResult<bool> {
        self.delete(RESERVATIONS, reservation_id)
    }

    // ── Scaling audit trail ────────────────────────────────────────

    /// Append a scaling decision to the audit trail.
    pub fn record_scaling_decision(&self, decision: &ScalingDecision) -> StateResult<()> {
        let key = decision.table_key();
        self.put(SCALING_DECISIONS, &key, decision)?;
        debug!(%key, action = %decision.action, "scaling decision recorded");
        Ok(())
    }

    /// Most recent decisions first, at most `limit`.
    pub fn list_scaling_decisions(&self, limit: usize) -> StateResult<Vec<ScalingDecision>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(SCALING_DECISIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))?.rev() {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use lablet_core::*;

    fn test_definition(id: &str, minor: u64) -> LabletDefinition {
        LabletDefinition {
            id: id.to_string(),
            version: semver::Version::new(1, minor, 0),
            resources: ResourceRequirements {
                cpu_cores: 4,
                memory_gb: 16,
                storage_gb: 50,
                nested_virt: false,
            },
            license_affinity: BTreeSet::from([LicenseType::Personal]),
            node_count: 3,
            port_template: vec!["console".to_string(), "ssh".to_string()],
            ami_requirements: None,
            max_duration_secs: 3600,
            artifact_uri: "s3://labs/ccna.yaml".to_string(),
            artifact_digest: None,
            assessment: false,
        }
    }

    fn test_worker(id: &str) -> Worker {
        Worker {
            id: id.to_string(),
            template_id: "personal-small".to_string(),
            license_type: LicenseType::Personal,
            capacity: Capacity::new(16, 64, 500, 20),
            nested_virt: false,
            port_range: PortRange::new(2000, 2009),
            image: "ami-cml".to_string(),
            status: WorkerStatus::Running,
            status_since: 1000,
        }
    }

    fn test_reservation(id: &str) -> Reservation {
        Reservation {
            id: id.to_string(),
            definition: DefinitionRef::new("ccna", semver::Version::new(1, 0, 0)),
            timeslot: Timeslot::new(2000, 5600),
            owner_id: "alice".to_string(),
            priority: 10,
            warm_lab: None,
        }
    }

    fn test_instance(id: &str, state: InstanceState) -> LabletInstance {
        let mut inst = LabletInstance::pending(id, &test_reservation(&format!("res-{id}")), 1000);
        inst.state = state;
        inst
    }

    // ── Definitions ────────────────────────────────────────────────

    #[test]
    fn definition_versions_are_separate_rows() {
        let store = StateStore::open_in_memory().unwrap();
        let v0 = test_definition("ccna", 0);
        let v1 = test_definition("ccna", 1);
        store.put_definition(&v0).unwrap();
        store.put_definition(&v1).unwrap();

        assert_eq!(store.list_definitions().unwrap().len(), 2);
        assert_eq!(store.get_definition(&v1.reference()).unwrap(), Some(v1));
    }

    #[test]
    fn definition_get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        let r = DefinitionRef::new("nope", semver::Version::new(0, 0, 1));
        assert!(store.get_definition(&r).unwrap().is_none());
    }

    // ── Workers ────────────────────────────────────────────────────

    #[test]
    fn worker_put_update_delete() {
        let store = StateStore::open_in_memory().unwrap();
        let mut worker = test_worker("w1");
        store.put_worker(&worker).unwrap();

        worker.status = WorkerStatus::Stopped;
        store.put_worker(&worker).unwrap();
        assert_eq!(
            store.get_worker("w1").unwrap().unwrap().status,
            WorkerStatus::Stopped
        );

        assert!(store.delete_worker("w1").unwrap());
        assert!(!store.delete_worker("w1").unwrap());
        assert!(store.list_workers().unwrap().is_empty());
    }

    // ── Instances ──────────────────────────────────────────────────

    #[test]
    fn active_instances_exclude_terminated() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&test_instance("i1", InstanceState::Running)).unwrap();
        store.put_instance(&test_instance("i2", InstanceState::Terminated)).unwrap();
        store.put_instance(&test_instance("i3", InstanceState::Pending)).unwrap();

        let active = store.list_active_instances().unwrap();
        let ids: Vec<_> = active.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["i1", "i3"]);
        assert_eq!(store.list_instances().unwrap().len(), 3);
    }

    #[test]
    fn instance_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let inst = test_instance("i1", InstanceState::Scheduled);
        store.put_instance(&inst).unwrap();
        assert_eq!(store.get_instance("i1").unwrap(), Some(inst));
        assert!(store.delete_instance("i1").unwrap());
        assert!(store.get_instance("i1").unwrap().is_none());
    }

    // ── Reservations ───────────────────────────────────────────────

    #[test]
    fn reservation_put_list_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_reservation(&test_reservation("r1")).unwrap();
        store.put_reservation(&test_reservation("r2")).unwrap();
        assert_eq!(store.list_reservations().unwrap().len(), 2);

        assert!(store.delete_reservation("r1").unwrap());
        assert!(store.get_reservation("r1").unwrap().is_none());
        assert!(store.get_reservation("r2").unwrap().is_some());
    }

    // ── Scaling audit ──────────────────────────────────────────────

    #[test]
    fn scaling_decisions_list_newest_first() {
        let store = StateStore::open_in_memory().unwrap();
        for (i, at) in [100u64, 300, 200].into_iter().enumerate() {
            store
                .record_scaling_decision(&ScalingDecision {
                    id: format!("d{i}"),
                    at,
                    reason: ScalingReason::Idle { idle_secs: 600 },
                    action: ScalingAction::Stop,
                    worker_id: Some("w1".to_string()),
                    template_id: None,
                })
                .unwrap();
        }

        let recent = store.list_scaling_decisions(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].at, 300);
        assert_eq!(recent[1].at, 200);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("lablet.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_worker(&test_worker("w1")).unwrap();
            store.put_instance(&test_instance("i1", InstanceState::Running)).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        assert_eq!(store.list_workers().unwrap().len(), 1);
        assert_eq!(store.list_active_instances().unwrap().len(), 1);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_definitions().unwrap().is_empty());
        assert!(store.list_workers().unwrap().is_empty());
        assert!(store.list_instances().unwrap().is_empty());
        assert!(store.list_reservations().unwrap().is_empty());
        assert!(store.list_scaling_decisions(10).unwrap().is_empty());
        assert!(!store.delete_instance("nope").unwrap());
        assert!(!store.delete_reservation("nope").unwrap());
    }
}
