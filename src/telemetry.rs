use crate::timestamp::{Provenance, RawTimestamp, TimestampMode};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use simd_json::prelude::*;
use simd_json::{BorrowedValue, StaticNode};
use uuid::Uuid;

/// A persisted (or about to be persisted) sensor reading on the canonical timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub tenant_id: Uuid,
    pub asset_code: String,
    pub sensor: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub provenance: Provenance,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorSample {
    pub sensor: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryPayload {
    pub raw_timestamp: RawTimestamp,
    pub mode_override: Option<TimestampMode>,
    pub samples: Vec<SensorSample>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatePayload {
    pub state: String,
    pub raw_timestamp: RawTimestamp,
}

/// Decodes `{"sensor": .., "value": .., "ts": ..}` or `{"ts": .., "values": {sensor: value}}`.
pub fn parse_telemetry_payload(payload: &mut [u8]) -> Result<TelemetryPayload> {
    let value = simd_json::to_borrowed_value(payload)?;
    let BorrowedValue::Object(obj) = value else {
        bail!("telemetry payload is not a JSON object");
    };

    let raw_timestamp = obj
        .get("ts")
        .or_else(|| obj.get("timestamp"))
        .map(raw_timestamp)
        .unwrap_or(RawTimestamp::Absent);
    let mode_override = obj
        .get("tsMode")
        .and_then(|value| value.as_str())
        .and_then(|raw| raw.parse::<TimestampMode>().ok());

    let mut samples = Vec::new();
    if let Some(BorrowedValue::Object(values)) = obj.get("values") {
        for (sensor, value) in values.iter() {
            let sensor = sensor.trim();
            if sensor.is_empty() {
                continue;
            }
            if let Some(value) = finite_number(value) {
                samples.push(SensorSample {
                    sensor: sensor.to_string(),
                    value,
                });
            }
        }
        samples.sort_by(|a, b| a.sensor.cmp(&b.sensor));
    } else {
        let sensor = obj
            .get("sensor")
            .and_then(|value| value.as_str())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let value = obj.get("value").and_then(finite_number);
        match (sensor, value) {
            (Some(sensor), Some(value)) => samples.push(SensorSample {
                sensor: sensor.to_string(),
                value,
            }),
            (None, _) => bail!("telemetry payload has no sensor name"),
            (_, None) => bail!("telemetry payload has no finite value"),
        }
    }

    if samples.is_empty() {
        bail!("telemetry payload carries no usable samples");
    }

    Ok(TelemetryPayload {
        raw_timestamp,
        mode_override,
        samples,
    })
}

pub fn parse_state_payload(payload: &mut [u8]) -> Option<StatePayload> {
    let first = payload
        .iter()
        .copied()
        .find(|byte| !byte.is_ascii_whitespace())?;

    if first == b'{' {
        let BorrowedValue::Object(obj) = simd_json::to_borrowed_value(payload).ok()? else {
            return None;
        };
        let state = obj
            .get("state")
            .or_else(|| obj.get("status"))
            .and_then(|value| value.as_str())
            .map(str::trim)
            .filter(|value| !value.is_empty())?
            .to_string();
        let raw_timestamp = obj
            .get("ts")
            .or_else(|| obj.get("timestamp"))
            .map(raw_timestamp)
            .unwrap_or(RawTimestamp::Absent);
        return Some(StatePayload {
            state,
            raw_timestamp,
        });
    }

    let text = std::str::from_utf8(payload).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    Some(StatePayload {
        state: text.to_string(),
        raw_timestamp: RawTimestamp::Absent,
    })
}

fn raw_timestamp(value: &BorrowedValue) -> RawTimestamp {
    match value {
        BorrowedValue::String(text) => RawTimestamp::Text(text.to_string()),
        BorrowedValue::Static(StaticNode::Null) => RawTimestamp::Absent,
        BorrowedValue::Static(StaticNode::Bool(_)) => RawTimestamp::Other,
        BorrowedValue::Static(_) => number(value)
            .map(RawTimestamp::Number)
            .unwrap_or(RawTimestamp::Other),
        _ => RawTimestamp::Other,
    }
}

fn number(value: &BorrowedValue) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_i64().map(|v| v as f64))
        .or_else(|| value.as_u64().map(|v| v as f64))
}

fn finite_number(value: &BorrowedValue) -> Option<f64> {
    number(value).filter(|v| v.is_finite())
}
