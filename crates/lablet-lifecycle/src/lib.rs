//! lablet-lifecycle: per-instance state and transition enforcement.
//!
//! # Architecture
//!
//! ```text
//!   trigger ──▶ transitions::plan(state, trigger) ──▶ Plan
//!                        │                              │
//!                 central TRANSITIONS table     Apply(path) / Ignore
//!                                                       │
//!   LifecycleStateMachine ◀─────────────────────────────┘
//!     ├─ enter each state on the path (one event per state)
//!     ├─ on TERMINATED: ledger.release(lease), then ports.release
//!     └─ write-through to the StateStore
//! ```
//!
//! The edge set lives in one table so the graph can be read and audited
//! in one place. External completions that arrive after the instance has
//! already moved past their target are ignored rather than rejected.

pub mod error;
pub mod machine;
pub mod transitions;

pub use error::{LifecycleError, LifecycleResult};
pub use machine::{LifecycleStateMachine, Outcome};
pub use transitions::{Plan, TRANSITIONS, Trigger, plan};
