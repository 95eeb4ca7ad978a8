//! redb table definitions for the lablet state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Lablet definitions keyed by `{id}@{version}`.
pub const DEFINITIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("definitions");

/// Workers keyed by `{worker_id}`.
pub const WORKERS: TableDefinition<&str, &[u8]> = TableDefinition::new("workers");

/// Lablet instances keyed by `{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Queued (not yet bound) reservations keyed by `{reservation_id}`.
pub const RESERVATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("reservations");

/// Scaling audit trail keyed by `{at:020}:{decision_id}`.
pub const SCALING_DECISIONS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("scaling_decisions");
