//! Duration strings used in `lablet.toml` (`"30s"`, `"5m"`, `"2h"`, `"90"`).

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid duration: {0:?} (expected e.g. \"30s\", \"15m\", \"2h\")")]
pub struct DurationError(pub String);

/// Parse a duration string into seconds.
pub fn parse_duration_secs(s: &str) -> Result<u64, DurationError> {
    let s = s.trim();
    let invalid = || DurationError(s.to_string());

    let (digits, multiplier) = if let Some(secs) = s.strip_suffix('s') {
        (secs, 1)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600)
    } else {
        (s, 1)
    };

    let value: u64 = digits.trim().parse().map_err(|_| invalid())?;
    value.checked_mul(multiplier).ok_or_else(invalid)
}
