//! Domain types for the lablet engine.
//!
//! These types are shared by every component and persisted by
//! `lablet-state`, so all of them are serializable to/from JSON.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a worker (compute node).
pub type WorkerId = String;

/// Unique identifier for a lablet instance.
pub type InstanceId = String;

/// Unique identifier for a reservation request.
pub type ReservationId = String;

/// Identifier of a lablet definition (shared by all its versions).
pub type DefinitionId = String;

// ── Licensing ─────────────────────────────────────────────────────

/// License tier a worker runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LicenseType {
    Personal,
    Enterprise,
}

impl LicenseType {
    /// Node ceiling a worker of this license gets when none is declared.
    ///
    /// PERSONAL licenses are capped by `personal_limit`; ENTERPRISE is
    /// effectively unbounded.
    pub fn default_node_ceiling(self, personal_limit: u32) -> u32 {
        match self {
            LicenseType::Personal => personal_limit,
            LicenseType::Enterprise => u32::MAX,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LicenseType::Personal => "PERSONAL",
            LicenseType::Enterprise => "ENTERPRISE",
        }
    }
}

impl fmt::Display for LicenseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Capacity ──────────────────────────────────────────────────────

/// A multi-dimensional amount of worker capacity.
///
/// Used both for a worker's declared capacity (where `nodes` is the
/// per-worker node ceiling) and for the demand of a single instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capacity {
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub storage_gb: u32,
    pub nodes: u32,
}

impl Capacity {
    pub const ZERO: Capacity = Capacity {
        cpu_cores: 0,
        memory_gb: 0,
        storage_gb: 0,
        nodes: 0,
    };

    pub fn new(cpu_cores: u32, memory_gb: u32, storage_gb: u32, nodes: u32) -> Self {
        Self {
            cpu_cores,
            memory_gb,
            storage_gb,
            nodes,
        }
    }

    /// True if every dimension of `self` is at most the same dimension of `other`.
    pub fn fits_within(&self, other: &Capacity) -> bool {
        self.cpu_cores <= other.cpu_cores
            && self.memory_gb <= other.memory_gb
            && self.storage_gb <= other.storage_gb
            && self.nodes <= other.nodes
    }

    pub fn checked_add(&self, other: &Capacity) -> Option<Capacity> {
        Some(Capacity {
            cpu_cores: self.cpu_cores.checked_add(other.cpu_cores)?,
            memory_gb: self.memory_gb.checked_add(other.memory_gb)?,
            storage_gb: self.storage_gb.checked_add(other.storage_gb)?,
            nodes: self.nodes.checked_add(other.nodes)?,
        })
    }

    pub fn checked_sub(&self, other: &Capacity) -> Option<Capacity> {
        Some(Capacity {
            cpu_cores: self.cpu_cores.checked_sub(other.cpu_cores)?,
            memory_gb: self.memory_gb.checked_sub(other.memory_gb)?,
            storage_gb: self.storage_gb.checked_sub(other.storage_gb)?,
            nodes: self.nodes.checked_sub(other.nodes)?,
        })
    }

    pub fn saturating_sub(&self, other: &Capacity) -> Capacity {
        Capacity {
            cpu_cores: self.cpu_cores.saturating_sub(other.cpu_cores),
            memory_gb: self.memory_gb.saturating_sub(other.memory_gb),
            storage_gb: self.storage_gb.saturating_sub(other.storage_gb),
            nodes: self.nodes.saturating_sub(other.nodes),
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Capacity::ZERO
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={} mem={}G disk={}G nodes={}",
            self.cpu_cores, self.memory_gb, self.storage_gb, self.nodes
        )
    }
}

/// Inclusive range of ports a worker hands out to instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Number of ports in the range (0 for an inverted range).
    pub fn len(&self) -> u32 {
        if self.end < self.start {
            0
        } else {
            u32::from(self.end) - u32::from(self.start) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

// ── Definitions ───────────────────────────────────────────────────

/// Per-instance resource needs of a lablet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub storage_gb: u32,
    /// Whether the lab needs nested virtualization on the worker.
    #[serde(default)]
    pub nested_virt: bool,
}

/// Immutable, semantically versioned lab template.
///
/// A content change produces a new version; an existing `(id, version)`
/// is never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabletDefinition {
    pub id: DefinitionId,
    pub version: semver::Version,
    pub resources: ResourceRequirements,
    pub license_affinity: BTreeSet<LicenseType>,
    pub node_count: u32,
    /// Ordered logical port names; position `i` receives the `i`-th allocated port.
    pub port_template: Vec<String>,
    /// Regex the worker image identity must match, if any.
    #[serde(default)]
    pub ami_requirements: Option<String>,
    pub max_duration_secs: u64,
    /// Where the lab artifact lives (s3://, https://, file://).
    pub artifact_uri: String,
    /// Content digest recorded at registration.
    #[serde(default)]
    pub artifact_digest: Option<String>,
    /// Whether the instance is collected and graded at the end of its timeslot.
    #[serde(default)]
    pub assessment: bool,
}

impl LabletDefinition {
    pub fn reference(&self) -> DefinitionRef {
        DefinitionRef {
            id: self.id.clone(),
            version: self.version.clone(),
        }
    }

    pub fn port_count(&self) -> u32 {
        self.port_template.len() as u32
    }

    /// Capacity one instance debits from the ledger.
    pub fn demand(&self) -> Capacity {
        Capacity {
            cpu_cores: self.resources.cpu_cores,
            memory_gb: self.resources.memory_gb,
            storage_gb: self.resources.storage_gb,
            nodes: self.node_count,
        }
    }
}

/// Pointer to one version of a definition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DefinitionRef {
    pub id: DefinitionId,
    pub version: semver::Version,
}

impl DefinitionRef {
    pub fn new(id: &str, version: semver::Version) -> Self {
        Self {
            id: id.to_string(),
            version,
        }
    }

    /// Build the composite key for the definitions table.
    pub fn table_key(&self) -> String {
        format!("{}@{}", self.id, self.version)
    }
}

impl fmt::Display for DefinitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

// ── Workers ───────────────────────────────────────────────────────

/// Lifecycle status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Terminated,
}

impl WorkerStatus {
    /// Provisioning and stopping workers are mid-transition and are
    /// neither placement nor scaling candidates.
    pub fn is_transitioning(self) -> bool {
        matches!(self, WorkerStatus::Provisioning | WorkerStatus::Stopping)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerStatus::Provisioning => "PROVISIONING",
            WorkerStatus::Running => "RUNNING",
            WorkerStatus::Stopping => "STOPPING",
            WorkerStatus::Stopped => "STOPPED",
            WorkerStatus::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

/// Shape of a worker the capacity provider can create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerTemplate {
    pub id: String,
    pub license_type: LicenseType,
    /// Declared capacity; `nodes` is the node ceiling.
    pub capacity: Capacity,
    #[serde(default)]
    pub nested_virt: bool,
    pub port_range: PortRange,
    /// Image identity (AMI id / name) workers boot from.
    pub image: String,
}

impl WorkerTemplate {
    /// Build the worker record for a freshly provisioned node.
    pub fn instantiate(&self, worker_id: &str, now: u64) -> Worker {
        Worker {
            id: worker_id.to_string(),
            template_id: self.id.clone(),
            license_type: self.license_type,
            capacity: self.capacity,
            nested_virt: self.nested_virt,
            port_range: self.port_range,
            image: self.image.clone(),
            status: WorkerStatus::Provisioning,
            status_since: now,
        }
    }
}

/// A compute node with declared, finite capacity and a port range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub template_id: String,
    pub license_type: LicenseType,
    /// Declared capacity; `nodes` is the node ceiling (`max_nodes`).
    pub capacity: Capacity,
    #[serde(default)]
    pub nested_virt: bool,
    pub port_range: PortRange,
    pub image: String,
    pub status: WorkerStatus,
    /// Unix timestamp of the last status change.
    pub status_since: u64,
}

impl Worker {
    pub fn max_nodes(&self) -> u32 {
        self.capacity.nodes
    }
}

// ── Reservations ──────────────────────────────────────────────────

/// Reserved `[start, end)` window, in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeslot {
    pub start: u64,
    pub end: u64,
}

impl Timeslot {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn is_well_formed(&self) -> bool {
        self.end > self.start
    }

    pub fn duration_secs(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }
}

/// A previously imported, currently stopped lab that can be reactivated
/// instead of importing the artifact again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmLab {
    pub worker_id: WorkerId,
    pub lab_id: String,
}

/// A request to run one instance of a definition in a timeslot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub definition: DefinitionRef,
    pub timeslot: Timeslot,
    pub owner_id: String,
    /// 0 is the most urgent.
    pub priority: u32,
    #[serde(default)]
    pub warm_lab: Option<WarmLab>,
}

// ── Leases & port allocations ─────────────────────────────────────

/// Handle for capacity debited from the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub u64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease-{}", self.0)
    }
}

/// Debited-but-not-yet-released demand on one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    pub worker_id: WorkerId,
    pub demand: Capacity,
}

/// Ports leased to one instance on one worker, in ascending order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocation {
    pub worker_id: WorkerId,
    pub instance_id: InstanceId,
    pub ports: Vec<u16>,
}

// ── Instances ─────────────────────────────────────────────────────

/// Lifecycle state of a lablet instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Pending,
    Scheduled,
    Instantiating,
    Running,
    Collecting,
    Grading,
    Stopping,
    Stopped,
    Archived,
    Terminated,
}

impl InstanceState {
    pub const ALL: [InstanceState; 10] = [
        InstanceState::Pending,
        InstanceState::Scheduled,
        InstanceState::Instantiating,
        InstanceState::Running,
        InstanceState::Collecting,
        InstanceState::Grading,
        InstanceState::Stopping,
        InstanceState::Stopped,
        InstanceState::Archived,
        InstanceState::Terminated,
    ];

    /// Position along the forward lifecycle. Used to decide whether an
    /// instance is already past a trigger's target.
    pub fn rank(self) -> u8 {
        match self {
            InstanceState::Pending => 0,
            InstanceState::Scheduled => 1,
            InstanceState::Instantiating => 2,
            InstanceState::Running => 3,
            InstanceState::Collecting => 4,
            InstanceState::Grading => 5,
            InstanceState::Stopping => 6,
            InstanceState::Stopped => 7,
            InstanceState::Archived => 8,
            InstanceState::Terminated => 9,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == InstanceState::Terminated
    }

    /// True for states that must carry a worker binding.
    pub fn requires_worker(self) -> bool {
        !self.is_terminal() && self.rank() >= InstanceState::Scheduled.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Pending => "PENDING",
            InstanceState::Scheduled => "SCHEDULED",
            InstanceState::Instantiating => "INSTANTIATING",
            InstanceState::Running => "RUNNING",
            InstanceState::Collecting => "COLLECTING",
            InstanceState::Grading => "GRADING",
            InstanceState::Stopping => "STOPPING",
            InstanceState::Stopped => "STOPPED",
            InstanceState::Archived => "ARCHIVED",
            InstanceState::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime binding of a definition to a worker for a bounded timeslot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabletInstance {
    pub id: InstanceId,
    pub reservation_id: ReservationId,
    pub definition: DefinitionRef,
    pub owner_id: String,
    /// Set exactly once, when the instance is scheduled.
    pub worker_id: Option<WorkerId>,
    pub state: InstanceState,
    pub lease: Option<Lease>,
    pub port_allocation: Option<PortAllocation>,
    /// `logical_name → port`, fixed at INSTANTIATING entry.
    pub allocated_ports: BTreeMap<String, u16>,
    /// Lab id returned by the orchestrator after import.
    pub lab_id: Option<String>,
    pub warm_lab: Option<WarmLab>,
    pub timeslot: Timeslot,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub terminated_at: Option<u64>,
    pub updated_at: u64,
}

impl LabletInstance {
    /// A fresh PENDING instance for a reservation.
    pub fn pending(id: &str, reservation: &Reservation, now: u64) -> Self {
        Self {
            id: id.to_string(),
            reservation_id: reservation.id.clone(),
            definition: reservation.definition.clone(),
            owner_id: reservation.owner_id.clone(),
            worker_id: None,
            state: InstanceState::Pending,
            lease: None,
            port_allocation: None,
            allocated_ports: BTreeMap::new(),
            lab_id: None,
            warm_lab: reservation.warm_lab.clone(),
            timeslot: reservation.timeslot,
            created_at: now,
            started_at: None,
            terminated_at: None,
            updated_at: now,
        }
    }

    /// Ports currently leased to this instance.
    pub fn ports(&self) -> &[u16] {
        self.port_allocation
            .as_ref()
            .map(|a| a.ports.as_slice())
            .unwrap_or(&[])
    }
}

// ── Scaling audit ─────────────────────────────────────────────────

/// Why the scaling controller acted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScalingReason {
    /// A reservation starting within the lookahead horizon could not be placed.
    UnmetDemand { reservation_id: ReservationId },
    /// The reservation queue grew past its threshold.
    QueueDepth { depth: usize, threshold: usize },
    /// Worker had no bound work for at least the stop grace period.
    Idle { idle_secs: u64 },
    /// Stopped worker stayed idle beyond the retention threshold.
    RetentionExpired { idle_secs: u64 },
}

impl fmt::Display for ScalingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalingReason::UnmetDemand { reservation_id } => {
                write!(f, "unmet demand for reservation {reservation_id}")
            }
            ScalingReason::QueueDepth { depth, threshold } => {
                write!(f, "queue depth {depth} exceeds {threshold}")
            }
            ScalingReason::Idle { idle_secs } => write!(f, "idle for {idle_secs}s"),
            ScalingReason::RetentionExpired { idle_secs } => {
                write!(f, "retention expired after {idle_secs}s idle")
            }
        }
    }
}

/// What the scaling controller asked the capacity provider to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    Provision,
    Start,
    Stop,
    Terminate,
}

impl fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScalingAction::Provision => "provision",
            ScalingAction::Start => "start",
            ScalingAction::Stop => "stop",
            ScalingAction::Terminate => "terminate",
        };
        f.write_str(s)
    }
}

/// Auditable record of one scaling decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub id: String,
    pub at: u64,
    pub reason: ScalingReason,
    pub action: ScalingAction,
    /// Target worker; `None` for a provision that has not returned yet.
    pub worker_id: Option<WorkerId>,
    pub template_id: Option<String>,
}

impl ScalingDecision {
    /// Build the composite key for the scaling audit table (time ordered).
    pub fn table_key(&self) -> String {
        format!("{:020}:{}", self.at, self.id)
    }
}
