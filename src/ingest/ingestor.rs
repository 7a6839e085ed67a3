use super::{DropReason, InboundMessage, Ingestor, Outcome};
use crate::pipeline::IngestStats;
use crate::rules::{RuleEngine, WindowKey};
use crate::store;
use crate::telemetry::{parse_state_payload, parse_telemetry_payload, Reading};
use crate::tenant::{resolve_tenant, run_in_tenant_scope, TenantTx};
use crate::timestamp::{is_suspicious, normalize, NormalizedTimestamp, Provenance, RawTimestamp, TimestampMode};
use crate::topic::{self, Channel, TopicRoute};
use anyhow::Result;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceCheck {
    Accepted,
    UnknownDevice,
    KeyMismatch,
}

impl DeviceCheck {
    fn into_drop(self, route: &TopicRoute) -> Option<Outcome> {
        match self {
            DeviceCheck::Accepted => None,
            DeviceCheck::UnknownDevice => Some(Outcome::Dropped(DropReason::UnknownDevice(
                route.device_id.clone(),
            ))),
            DeviceCheck::KeyMismatch => Some(Outcome::Dropped(DropReason::IngestKeyMismatch(
                route.device_id.clone(),
            ))),
        }
    }
}

impl Ingestor {
    /// Resolves, normalizes, persists, then evaluates rules for one transport message.
    ///
    /// Persisting and rule evaluation are separate tenant-scoped units of work: once the readings
    /// are committed, evaluation failures are logged and counted but do not fail the message.
    pub async fn process(&self, engine: &mut RuleEngine, message: InboundMessage) -> Result<Outcome> {
        let Some(route) = topic::resolve(&message.topic) else {
            return Ok(Outcome::Dropped(DropReason::UnparseableTopic));
        };
        if let Channel::Other(name) = &route.channel {
            return Ok(Outcome::Dropped(DropReason::UnsupportedChannel(name.clone())));
        }

        let Some(tenant_id) = resolve_tenant(&self.pool, &route.tenant_slug).await? else {
            return Ok(Outcome::Dropped(DropReason::UnknownTenant(
                route.tenant_slug.clone(),
            )));
        };

        let InboundMessage {
            mut payload,
            received_at,
            ..
        } = message;

        match &route.channel {
            Channel::Telemetry => {
                self.ingest_telemetry(engine, tenant_id, &route, &mut payload, received_at)
                    .await
            }
            Channel::State => {
                self.ingest_state(tenant_id, &route, &mut payload, received_at)
                    .await
            }
            Channel::Other(name) => Ok(Outcome::Dropped(DropReason::UnsupportedChannel(
                name.clone(),
            ))),
        }
    }

    async fn ingest_telemetry(
        &self,
        engine: &mut RuleEngine,
        tenant_id: Uuid,
        route: &TopicRoute,
        payload: &mut [u8],
        received_at: DateTime<Utc>,
    ) -> Result<Outcome> {
        let parsed = match parse_telemetry_payload(payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                return Ok(Outcome::Dropped(DropReason::UndecodablePayload(
                    err.to_string(),
                )))
            }
        };
        let mode = parsed.mode_override.unwrap_or(self.timestamp_mode);
        let normalized = self.normalize_timestamp(&parsed.raw_timestamp, received_at, mode, route);

        let readings: Vec<Reading> = parsed
            .samples
            .into_iter()
            .map(|sample| Reading {
                tenant_id,
                asset_code: route.device_id.clone(),
                sensor: sample.sensor,
                timestamp: normalized.instant,
                value: sample.value,
                provenance: normalized.provenance,
                received_at,
            })
            .collect();

        let device_id = route.device_id.clone();
        let ingest_key = route.ingest_key.clone();
        let to_persist = readings.clone();
        let check = run_in_tenant_scope(&self.pool, tenant_id, move |scope| {
            Box::pin(async move {
                let check = verify_device(scope, &device_id, ingest_key.as_deref()).await?;
                if check != DeviceCheck::Accepted {
                    return Ok(check);
                }
                for reading in &to_persist {
                    store::insert_reading(scope.conn(), reading).await?;
                }
                let tenant_id = scope.tenant_id();
                store::touch_device(scope.conn(), tenant_id, &device_id, received_at, None).await?;
                Ok(DeviceCheck::Accepted)
            })
        })
        .await?;

        if let Some(dropped) = check.into_drop(route) {
            return Ok(dropped);
        }
        tracing::debug!(
            tenant = %route.tenant_slug,
            device = %route.device_id,
            readings = readings.len(),
            provenance = %normalized.provenance,
            "persisted readings"
        );

        for reading in &readings {
            if let Err(err) = self.evaluate(engine, reading).await {
                IngestStats::incr(&self.stats.rule_failures);
                // The window may have missed this reading; reseed it from storage next time.
                engine.invalidate(&WindowKey::for_reading(reading));
                tracing::warn!(
                    tenant = %route.tenant_slug,
                    asset = %reading.asset_code,
                    sensor = %reading.sensor,
                    error = %err,
                    "rule evaluation failed; reading kept"
                );
            }
        }

        Ok(Outcome::Persisted {
            readings: readings.len(),
        })
    }

    async fn ingest_state(
        &self,
        tenant_id: Uuid,
        route: &TopicRoute,
        payload: &mut [u8],
        received_at: DateTime<Utc>,
    ) -> Result<Outcome> {
        let Some(state) = parse_state_payload(payload) else {
            return Ok(Outcome::Dropped(DropReason::UndecodablePayload(
                "state payload carries no state".to_string(),
            )));
        };
        let seen_at = self
            .normalize_timestamp(&state.raw_timestamp, received_at, self.timestamp_mode, route)
            .instant;

        let device_id = route.device_id.clone();
        let ingest_key = route.ingest_key.clone();
        let state_label = state.state.clone();
        let check = run_in_tenant_scope(&self.pool, tenant_id, move |scope| {
            Box::pin(async move {
                let check = verify_device(scope, &device_id, ingest_key.as_deref()).await?;
                if check != DeviceCheck::Accepted {
                    return Ok(check);
                }
                let tenant_id = scope.tenant_id();
                store::touch_device(scope.conn(), tenant_id, &device_id, seen_at, Some(state_label.as_str()))
                    .await?;
                Ok(DeviceCheck::Accepted)
            })
        })
        .await?;

        if let Some(dropped) = check.into_drop(route) {
            return Ok(dropped);
        }
        tracing::debug!(
            tenant = %route.tenant_slug,
            device = %route.device_id,
            state = %state.state,
            "recorded device state"
        );
        Ok(Outcome::StateRecorded)
    }

    fn normalize_timestamp(
        &self,
        raw: &RawTimestamp,
        received_at: DateTime<Utc>,
        mode: TimestampMode,
        route: &TopicRoute,
    ) -> NormalizedTimestamp {
        let normalized = normalize(raw, received_at, mode);
        if normalized.provenance == Provenance::InvalidFallback {
            IngestStats::incr(&self.stats.fallback_timestamps);
            tracing::debug!(
                tenant = %route.tenant_slug,
                device = %route.device_id,
                raw = ?raw,
                "device timestamp unusable; using receipt time"
            );
        }
        if is_suspicious(normalized.instant) {
            IngestStats::incr(&self.stats.suspicious_timestamps);
            tracing::warn!(
                tenant = %route.tenant_slug,
                device = %route.device_id,
                ts = %normalized.instant,
                provenance = %normalized.provenance,
                "suspicious reading timestamp"
            );
        }
        normalized
    }
}

async fn verify_device(
    scope: &mut TenantTx,
    device_id: &str,
    presented_key: Option<&str>,
) -> Result<DeviceCheck> {
    let tenant_id = scope.tenant_id();
    let Some(device) = store::find_device(scope.conn(), tenant_id, device_id).await? else {
        return Ok(DeviceCheck::UnknownDevice);
    };
    if ingest_key_matches(device.ingest_key_sha256.as_deref(), presented_key) {
        Ok(DeviceCheck::Accepted)
    } else {
        Ok(DeviceCheck::KeyMismatch)
    }
}

pub(in crate::ingest) fn ingest_key_digest(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("{digest:x}")
}

/// A device without a stored digest accepts any topic; otherwise the topic must carry the key.
fn ingest_key_matches(stored_sha256: Option<&str>, presented: Option<&str>) -> bool {
    let Some(stored) = stored_sha256.map(str::trim).filter(|v| !v.is_empty()) else {
        return true;
    };
    presented
        .map(|key| ingest_key_digest(key).eq_ignore_ascii_case(stored))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn digest_is_lowercase_hex_sha256() {
        assert_eq!(ingest_key_digest("abc"), ABC_SHA256);
    }

    #[test]
    fn devices_without_key_accept_any_topic() {
        assert!(ingest_key_matches(None, None));
        assert!(ingest_key_matches(None, Some("anything")));
        assert!(ingest_key_matches(Some("  "), None));
    }

    #[test]
    fn keyed_devices_require_matching_key() {
        assert!(ingest_key_matches(Some(ABC_SHA256), Some("abc")));
        assert!(ingest_key_matches(
            Some(&ABC_SHA256.to_ascii_uppercase()),
            Some("abc")
        ));
        assert!(!ingest_key_matches(Some(ABC_SHA256), Some("abd")));
        assert!(!ingest_key_matches(Some(ABC_SHA256), None));
    }
}
