//! Inputs to placement: what an instance needs and what each worker has.

use std::collections::BTreeSet;

use regex::Regex;

use lablet_capacity::{CapacityLedger, CapacitySnapshot, PortAllocator, PortSnapshot, WorkerFleet};
use lablet_core::{Capacity, LabletDefinition, LicenseType, Worker};

use crate::error::{PlacementError, PlacementResult};

/// Placement requirements of one instance of a definition.
#[derive(Debug, Clone)]
pub struct Requirements {
    pub license_affinity: BTreeSet<LicenseType>,
    /// Debited from the ledger; `nodes` is the definition's node count.
    pub demand: Capacity,
    pub nested_virt: bool,
    pub port_count: u32,
    pub image_pattern: Option<Regex>,
}

impl Requirements {
    pub fn from_definition(def: &LabletDefinition) -> PlacementResult<Self> {
        let image_pattern = def
            .ami_requirements
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| PlacementError::InvalidImagePattern {
                    pattern: pattern.to_string(),
                    source,
                })
            })
            .transpose()?;
        Ok(Self {
            license_affinity: def.license_affinity.clone(),
            demand: def.demand(),
            nested_virt: def.resources.nested_virt,
            port_count: def.port_count(),
            image_pattern,
        })
    }

    pub fn node_count(&self) -> u32 {
        self.demand.nodes
    }
}

/// A worker as placement sees it: the record plus point-in-time
/// capacity and port views.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub worker: Worker,
    pub capacity: CapacitySnapshot,
    pub ports: PortSnapshot,
}

impl Candidate {
    pub fn worker_id(&self) -> &str {
        &self.worker.id
    }
}

/// Snapshot every worker known to both the ledger and the allocator,
/// in worker id order.
pub fn collect_candidates(
    fleet: &WorkerFleet,
    ledger: &CapacityLedger,
    ports: &PortAllocator,
) -> Vec<Candidate> {
    fleet
        .list()
        .into_iter()
        .filter_map(|worker| {
            let capacity = ledger.snapshot(&worker.id).ok()?;
            let ports = ports.snapshot(&worker.id).ok()?;
            Some(Candidate {
                worker,
                capacity,
                ports,
            })
        })
        .collect()
}
