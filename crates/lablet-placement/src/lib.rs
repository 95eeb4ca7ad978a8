//! lablet-placement: which worker should host an instance.
//!
//! This crate makes decisions only; it never debits capacity. The
//! scheduler commits the chosen placement through the ledger and the
//! port allocator.
//!
//! # Components
//!
//! - **`candidate`**: `Requirements` from a definition, `Candidate` views of workers
//! - **`predicate`**: ordered, short-circuiting matching checks
//! - **`scorer`**: most-full-first ranking by resulting slack

pub mod candidate;
pub mod error;
pub mod predicate;
pub mod scorer;

pub use candidate::{Candidate, Requirements, collect_candidates};
pub use error::{PlacementError, PlacementResult};
pub use predicate::{Rejection, check, shape_fits};
pub use scorer::{Ranking, ScoredCandidate, rank_candidates, slack_after};
