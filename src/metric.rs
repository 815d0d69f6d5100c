//! Metric samples and the plaintext line protocol.
//!
//! Records look like `"<metric.path> <value> <unix_timestamp>"`, one per line.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single numeric sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Dot-segmented metric path.
    pub name: String,
    /// Sample value (always finite).
    pub value: f64,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
}

/// A sample that matched at least one pattern, ready to be stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedMetric {
    /// Dot-segmented metric path.
    pub name: String,
    /// Sample value.
    pub value: f64,
    /// Timestamp as received.
    pub timestamp: i64,
    /// Timestamp rounded to the retention step; this is the stored key.
    pub retention_timestamp: i64,
    /// Retention step in seconds.
    pub retention: i64,
    /// Every pattern the name matched, sorted.
    pub patterns: Vec<String>,
}

/// A stored point of a time series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    /// Retention-rounded timestamp.
    pub timestamp: i64,
    /// Sample value.
    pub value: f64,
}

/// Reasons a line is rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected 3 fields, got {0}")]
    FieldCount(usize),

    #[error("invalid metric name '{0}'")]
    InvalidName(String),

    #[error("invalid value '{0}'")]
    InvalidValue(String),

    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
}

/// Last second of year 9999; later timestamps are rejected.
pub const MAX_TIMESTAMP: i64 = 253_402_300_799;

/// Parses one plaintext record.
///
/// Trailing `\r`/`\n` are ignored. Float timestamps are truncated to seconds.
///
/// # Examples
///
/// ```
/// use tripwire::metric::parse_line;
///
/// let m = parse_line("servers.web1.cpu 42.5 1700000000\n").unwrap();
/// assert_eq!(m.name, "servers.web1.cpu");
/// assert_eq!(m.timestamp, 1_700_000_000);
/// assert!(parse_line("servers.web1.cpu 42.5").is_err());
/// ```
pub fn parse_line(line: &str) -> Result<Metric, ParseError> {
    let mut fields = line.split_ascii_whitespace();
    let (Some(name), Some(value), Some(timestamp), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(ParseError::FieldCount(line.split_ascii_whitespace().count()));
    };

    if name.split('.').any(str::is_empty) {
        return Err(ParseError::InvalidName(name.to_string()));
    }

    let value: f64 = value
        .parse()
        .map_err(|_| ParseError::InvalidValue(value.to_string()))?;
    if !value.is_finite() {
        return Err(ParseError::InvalidValue(value.to_string()));
    }

    let ts: f64 = timestamp
        .parse()
        .map_err(|_| ParseError::InvalidTimestamp(timestamp.to_string()))?;
    #[allow(clippy::cast_possible_truncation)]
    let ts_secs = ts.trunc() as i64;
    if !ts.is_finite() || ts_secs <= 0 || ts_secs > MAX_TIMESTAMP {
        return Err(ParseError::InvalidTimestamp(timestamp.to_string()));
    }

    Ok(Metric {
        name: name.to_string(),
        value,
        timestamp: ts_secs,
    })
}
