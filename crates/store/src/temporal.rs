//! Date-like field normalization.
//!
//! Stored records carry timestamps in three shapes:
//! 1. epoch milliseconds (the serialized form of a native timestamp),
//! 2. ISO-8601 strings (RFC-3339, naive date-time, or date only),
//! 3. `{ "seconds": .., "nanoseconds": .. }` objects (also `_seconds` /
//!    `_nanoseconds`).
//!
//! Every read of a date-like field goes through [`Temporal::from_value`] and
//! [`Temporal::to_utc`] so raw heterogeneous representations are never
//! compared directly.  Naive values are interpreted as UTC.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use thiserror::Error;

/// Reasons a value could not be normalized.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemporalError {
    #[error("unsupported temporal representation: {0}")]
    Unsupported(String),

    #[error("unparseable date string '{0}'")]
    Unparseable(String),

    #[error("timestamp out of range: {0}")]
    OutOfRange(String),
}

/// One of the accepted temporal representations, not yet normalized.
#[derive(Debug, Clone, PartialEq)]
pub enum Temporal {
    Millis(i64),
    Iso(String),
    Parts { seconds: i64, nanoseconds: u32 },
}

impl Temporal {
    /// Classify a JSON value.
    pub fn from_value(value: &Value) -> Result<Self, TemporalError> {
        match value {
            Value::Number(n) => {
                if let Some(ms) = n.as_i64() {
                    Ok(Temporal::Millis(ms))
                } else if let Some(ms) = n.as_f64() {
                    if ms.is_finite() {
                        Ok(Temporal::Millis(ms.trunc() as i64))
                    } else {
                        Err(TemporalError::OutOfRange(n.to_string()))
                    }
                } else {
                    Err(TemporalError::OutOfRange(n.to_string()))
                }
            }
            Value::String(s) => Ok(Temporal::Iso(s.trim().to_owned())),
            Value::Object(map) => {
                let seconds = map
                    .get("seconds")
                    .or_else(|| map.get("_seconds"))
                    .and_then(Value::as_i64)
                    .ok_or_else(|| TemporalError::Unsupported(value.to_string()))?;
                let nanoseconds = map
                    .get("nanoseconds")
                    .or_else(|| map.get("_nanoseconds"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                let nanoseconds = u32::try_from(nanoseconds)
                    .map_err(|_| TemporalError::OutOfRange(value.to_string()))?;
                Ok(Temporal::Parts {
                    seconds,
                    nanoseconds,
                })
            }
            other => Err(TemporalError::Unsupported(other.to_string())),
        }
    }

    /// Normalize to a UTC instant.
    pub fn to_utc(&self) -> Result<DateTime<Utc>, TemporalError> {
        match self {
            Temporal::Millis(ms) => DateTime::from_timestamp_millis(*ms)
                .ok_or_else(|| TemporalError::OutOfRange(ms.to_string())),
            Temporal::Parts {
                seconds,
                nanoseconds,
            } => DateTime::from_timestamp(*seconds, *nanoseconds)
                .ok_or_else(|| TemporalError::OutOfRange(format!("{seconds}s {nanoseconds}ns"))),
            Temporal::Iso(s) => parse_iso(s),
        }
    }
}

fn parse_iso(s: &str) -> Result<DateTime<Utc>, TemporalError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive.and_utc());
        }
    }
    Err(TemporalError::Unparseable(s.to_owned()))
}

/// Normalize any accepted representation in one step.
pub fn normalize(value: &Value) -> Result<DateTime<Utc>, TemporalError> {
    Temporal::from_value(value)?.to_utc()
}

/// Canonical calendar-day bucket, `YYYY-MM-DD` in UTC.
pub fn day_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

/// Canonical minute bucket, `YYYY-MM-DDTHH:MM` in UTC.
pub fn minute_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M").to_string()
}

/// Serialize an instant in the epoch-millisecond representation.
pub fn to_millis_value(at: DateTime<Utc>) -> Value {
    Value::from(at.timestamp_millis())
}
