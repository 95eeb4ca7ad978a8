//! Placement error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("invalid image pattern {pattern:?}: {source}")]
    InvalidImagePattern {
        pattern: String,
        source: regex::Error,
    },
}

pub type PlacementResult<T> = Result<T, PlacementError>;
