//! Canonical timestamps for device readings.
//!
//! Field devices often report uptime counters instead of wall-clock time, so numeric timestamps
//! are only trusted inside magnitude bands that correspond to plausible calendar dates.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::fmt;
use std::str::FromStr;

// Epoch milliseconds, roughly 2001..5138.
const EPOCH_MS_MIN: f64 = 1e12;
const EPOCH_MS_MAX: f64 = 1e14;
// Epoch seconds, roughly 2001..2286.
const EPOCH_S_MIN: f64 = 1e9;
const EPOCH_S_MAX: f64 = 1e10;

const SUSPICIOUS_BEFORE_YEAR: i32 = 2000;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampMode {
    #[default]
    Auto,
    Server,
    Device,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown timestamp mode `{0}` (expected auto, server or device)")]
pub struct UnknownTimestampMode(String);

impl FromStr for TimestampMode {
    type Err = UnknownTimestampMode;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(TimestampMode::Auto),
            "server" => Ok(TimestampMode::Server),
            "device" => Ok(TimestampMode::Device),
            other => Err(UnknownTimestampMode(other.to_string())),
        }
    }
}

/// Device-supplied time as it appeared in the payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RawTimestamp {
    Absent,
    Number(f64),
    Text(String),
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Server,
    DeviceIso,
    DeviceEpochMs,
    DeviceEpochS,
    InvalidFallback,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::Server => "server",
            Provenance::DeviceIso => "device_iso",
            Provenance::DeviceEpochMs => "device_epoch_ms",
            Provenance::DeviceEpochS => "device_epoch_s",
            Provenance::InvalidFallback => "invalid_fallback",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedTimestamp {
    pub instant: DateTime<Utc>,
    pub provenance: Provenance,
}

impl NormalizedTimestamp {
    fn new(instant: DateTime<Utc>, provenance: Provenance) -> Self {
        Self {
            instant,
            provenance,
        }
    }
}

pub fn normalize(
    raw: &RawTimestamp,
    received_at: DateTime<Utc>,
    mode: TimestampMode,
) -> NormalizedTimestamp {
    if mode == TimestampMode::Server {
        return NormalizedTimestamp::new(received_at, Provenance::Server);
    }

    match raw {
        RawTimestamp::Text(text) => match parse_calendar(text) {
            Some(instant) => NormalizedTimestamp::new(instant, Provenance::DeviceIso),
            None => NormalizedTimestamp::new(received_at, Provenance::InvalidFallback),
        },
        RawTimestamp::Number(value) => classify_epoch(*value)
            .map(|(instant, provenance)| NormalizedTimestamp::new(instant, provenance))
            .unwrap_or_else(|| NormalizedTimestamp::new(received_at, Provenance::InvalidFallback)),
        RawTimestamp::Absent | RawTimestamp::Other => {
            NormalizedTimestamp::new(received_at, Provenance::Server)
        }
    }
}

/// Instants before 2000 usually mean a device clock that was never set.
pub fn is_suspicious(instant: DateTime<Utc>) -> bool {
    instant.year() < SUSPICIOUS_BEFORE_YEAR
}

fn classify_epoch(value: f64) -> Option<(DateTime<Utc>, Provenance)> {
    if !value.is_finite() {
        return None;
    }
    if value > EPOCH_MS_MIN && value < EPOCH_MS_MAX {
        return millis_to_dt(value.trunc() as i64).map(|dt| (dt, Provenance::DeviceEpochMs));
    }
    if value > EPOCH_S_MIN && value < EPOCH_S_MAX {
        return millis_to_dt((value * 1000.0).trunc() as i64).map(|dt| (dt, Provenance::DeviceEpochS));
    }
    None
}

fn millis_to_dt(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn parse_calendar(raw: &str) -> Option<DateTime<Utc>> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}
