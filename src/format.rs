//! Display formatting and parsing of journal timestamps.

use crate::error::{QueryError, Result};
use chrono::{DateTime, Local, TimeZone};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EpochFormat {
    #[default]
    WithSeconds,
    WithoutSeconds,
}

impl EpochFormat {
    fn pattern(self) -> &'static str {
        match self {
            EpochFormat::WithSeconds => "%m/%d/%y, %H:%M:%S",
            EpochFormat::WithoutSeconds => "%m/%d/%y, %H:%M",
        }
    }
}

/// Format epoch microseconds as local time. Input that is not a number, or
/// is out of chrono's range, comes back unchanged.
pub fn format_epoch(input: &str, format: EpochFormat) -> String {
    let Ok(micros) = input.trim().parse::<i64>() else {
        return input.to_string();
    };
    match Local.timestamp_micros(micros).single() {
        Some(time) => time.format(format.pattern()).to_string(),
        None => input.to_string(),
    }
}

/// Parse a point in time given either as epoch microseconds or as an
/// RFC 3339 date such as `2024-03-01T12:00:00+01:00`.
pub fn parse_time(input: &str) -> Result<i64> {
    let input = input.trim();
    if let Ok(micros) = input.parse::<i64>() {
        return Ok(micros);
    }
    DateTime::parse_from_rfc3339(input)
        .map(|t| t.timestamp_micros())
        .map_err(|e| QueryError::InvalidSpec(format!("invalid time '{input}': {e}")))
}
