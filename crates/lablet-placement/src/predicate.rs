//! Matching predicate.
//!
//! Checks run cheapest first and stop at the first failure:
//!
//! 1. license type is in the definition's affinity
//! 2. worker is RUNNING
//! 3. node ceiling covers allocated + requested nodes
//! 4. available cpu/memory/storage (and nested virtualization)
//! 5. enough free ports
//! 6. image identity matches the definition's pattern

use std::fmt;

use lablet_core::{Capacity, LicenseType, PortRange, WorkerStatus};

use crate::candidate::{Candidate, Requirements};

/// Why a worker was not a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    License(LicenseType),
    NotRunning(WorkerStatus),
    NodeCeiling {
        ceiling: u32,
        allocated: u32,
        requested: u32,
    },
    Resources {
        available: Capacity,
        requested: Capacity,
    },
    NestedVirt,
    Ports { free: u32, requested: u32 },
    Image(String),
}

impl Rejection {
    /// Port exhaustion is reported to callers distinctly from other misses.
    pub fn is_port_exhaustion(&self) -> bool {
        matches!(self, Rejection::Ports { .. })
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::License(l) => write!(f, "license {l} not in affinity"),
            Rejection::NotRunning(s) => write!(f, "worker is {s}"),
            Rejection::NodeCeiling {
                ceiling,
                allocated,
                requested,
            } => write!(
                f,
                "node ceiling {ceiling} < {allocated} allocated + {requested} requested"
            ),
            Rejection::Resources {
                available,
                requested,
            } => write!(f, "insufficient capacity: requested {requested}, available {available}"),
            Rejection::NestedVirt => write!(f, "nested virtualization unavailable"),
            Rejection::Ports { free, requested } => {
                write!(f, "port exhaustion: requested {requested}, {free} free")
            }
            Rejection::Image(image) => write!(f, "image {image} does not match"),
        }
    }
}

/// Run the ordered checks against one candidate.
pub fn check(candidate: &Candidate, req: &Requirements) -> Result<(), Rejection> {
    let worker = &candidate.worker;

    if !req.license_affinity.contains(&worker.license_type) {
        return Err(Rejection::License(worker.license_type));
    }

    if worker.status != WorkerStatus::Running {
        return Err(Rejection::NotRunning(worker.status));
    }

    let ceiling = worker.max_nodes();
    let allocated = candidate.capacity.allocated.nodes;
    if u64::from(allocated) + u64::from(req.node_count()) > u64::from(ceiling) {
        return Err(Rejection::NodeCeiling {
            ceiling,
            allocated,
            requested: req.node_count(),
        });
    }

    let available = candidate.capacity.available();
    let requested = Capacity {
        nodes: 0,
        ..req.demand
    };
    if !requested.fits_within(&available) {
        return Err(Rejection::Resources {
            available,
            requested,
        });
    }
    if req.nested_virt && !worker.nested_virt {
        return Err(Rejection::NestedVirt);
    }

    if candidate.ports.free < req.port_count {
        return Err(Rejection::Ports {
            free: candidate.ports.free,
            requested: req.port_count,
        });
    }

    if let Some(pattern) = &req.image_pattern {
        if !pattern.is_match(&worker.image) {
            return Err(Rejection::Image(worker.image.clone()));
        }
    }

    Ok(())
}

/// Could an empty worker of this shape ever host the instance?
///
/// Used for static feasibility (is any worker or template able to take
/// it at all) and for picking a template to scale up with.
pub fn shape_fits(
    license: LicenseType,
    declared: &Capacity,
    nested_virt: bool,
    port_range: &PortRange,
    image: &str,
    req: &Requirements,
) -> bool {
    req.license_affinity.contains(&license)
        && req.demand.fits_within(declared)
        && (!req.nested_virt || nested_virt)
        && port_range.len() >= req.port_count
        && req
            .image_pattern
            .as_ref()
            .is_none_or(|pattern| pattern.is_match(image))
}
