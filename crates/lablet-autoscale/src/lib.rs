//! lablet-autoscale: reconciles worker supply with near-term demand.
//!
//! Scale-up is driven by unmet demand: a reservation starting within the
//! lookahead horizon that could not be placed, or a queue deeper than
//! its threshold. Scale-down is a periodic sweep over idle workers:
//! stop first, terminate once idle past the retention threshold.
//!
//! Every decision is written to the audit trail and published before the
//! capacity provider is called.

pub mod controller;
pub mod error;

pub use controller::ScalingController;
pub use error::{AutoscaleError, AutoscaleResult};
