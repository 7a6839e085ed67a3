use super::types::{compare, Rule, RuleKind};
use super::window::{Observation, RocWindow, WindowPoint};
use crate::telemetry::Reading;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertStatus {
    Open,
    Ack,
    Closed,
}

impl AlertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertStatus::Open => "OPEN",
            AlertStatus::Ack => "ACK",
            AlertStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "OPEN" => Some(AlertStatus::Open),
            "ACK" => Some(AlertStatus::Ack),
            "CLOSED" => Some(AlertStatus::Closed),
            _ => None,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, AlertStatus::Open | AlertStatus::Ack)
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The OPEN or ACK alert currently held by a rule, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveAlert {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub status: AlertStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertPolicy {
    pub auto_close_acked: bool,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            auto_close_acked: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Breached { observed: f64, message: String },
    Clear { observed: f64 },
    /// Not enough history to decide; existing alerts are left alone.
    Insufficient,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlertAction {
    Open {
        rule_id: Uuid,
        rule_type: &'static str,
        observed_value: f64,
        message: String,
        at: DateTime<Utc>,
    },
    Close {
        alert_id: Uuid,
        rule_id: Uuid,
        observed_value: f64,
        at: DateTime<Utc>,
    },
}

impl AlertAction {
    pub fn rule_id(&self) -> Uuid {
        match self {
            AlertAction::Open { rule_id, .. } | AlertAction::Close { rule_id, .. } => *rule_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub tenant_id: Uuid,
    pub asset_code: String,
    pub sensor: String,
}

impl WindowKey {
    pub fn for_reading(reading: &Reading) -> Self {
        Self {
            tenant_id: reading.tenant_id,
            asset_code: reading.asset_code.clone(),
            sensor: reading.sensor.clone(),
        }
    }
}

/// Largest window of any enabled rate-of-change rule, or `None` when there is none.
pub fn required_retention(rules: &[Rule]) -> Option<i64> {
    rules
        .iter()
        .filter(|rule| rule.enabled)
        .filter_map(|rule| rule.kind.window_seconds())
        .max()
}

/// Newest canonical timestamp evaluated for a key, whether or not any rule matched it.
#[derive(Debug, Clone, Copy)]
struct SensorClock {
    newest: DateTime<Utc>,
    touched: Instant,
}

/// Per-worker rule evaluation state.
///
/// Each worker owns one engine, and messages for a device always land on the same worker, so the
/// windows need no locking.
#[derive(Debug, Default)]
pub struct RuleEngine {
    windows: HashMap<WindowKey, RocWindow>,
    clocks: HashMap<WindowKey, SensorClock>,
    policy: AlertPolicy,
}

impl RuleEngine {
    pub fn new(policy: AlertPolicy) -> Self {
        Self {
            windows: HashMap::new(),
            clocks: HashMap::new(),
            policy,
        }
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Retention to load from storage when the cached window is missing or too narrow for `rules`.
    pub fn needs_seed(&self, key: &WindowKey, rules: &[Rule]) -> Option<i64> {
        let required = required_retention(rules)?;
        match self.windows.get(key) {
            Some(window) if window.retention_seconds() >= required => None,
            _ => Some(required),
        }
    }

    pub fn seed(&mut self, key: WindowKey, retention_seconds: i64, points: Vec<WindowPoint>) {
        self.windows
            .insert(key, RocWindow::seeded(retention_seconds, points));
    }

    /// Feeds the reading into its window. Returns `None` when the key has no window.
    pub fn observe(&mut self, reading: &Reading) -> Option<Observation> {
        let window = self.windows.get_mut(&WindowKey::for_reading(reading))?;
        Some(window.observe(reading.timestamp, reading.value))
    }

    /// Drops the cached window so the next evaluation reseeds it from storage.
    pub fn invalidate(&mut self, key: &WindowKey) -> bool {
        self.windows.remove(key).is_some()
    }

    /// Drops every cached window for the asset, across tenants and sensors.
    pub fn invalidate_asset(&mut self, asset_code: &str) -> usize {
        let before = self.windows.len();
        self.windows.retain(|key, _| key.asset_code != asset_code);
        before - self.windows.len()
    }

    /// Moves the key's clock forward to the reading's timestamp. Older readings leave it alone.
    pub fn advance_clock(&mut self, reading: &Reading) {
        let now = Instant::now();
        self.clocks
            .entry(WindowKey::for_reading(reading))
            .and_modify(|clock| {
                clock.newest = clock.newest.max(reading.timestamp);
                clock.touched = now;
            })
            .or_insert(SensorClock {
                newest: reading.timestamp,
                touched: now,
            });
    }

    /// True when a newer reading for the same key has already been evaluated.
    pub fn is_late(&self, reading: &Reading) -> bool {
        self.clocks
            .get(&WindowKey::for_reading(reading))
            .is_some_and(|clock| reading.timestamp < clock.newest)
    }

    pub fn evaluate_rule(&self, rule: &Rule, reading: &Reading) -> Evaluation {
        match &rule.kind {
            RuleKind::Threshold { operator, value } => {
                if compare(reading.value, *operator, *value) {
                    Evaluation::Breached {
                        observed: reading.value,
                        message: format!(
                            "{} {} {} (observed {})",
                            reading.sensor, operator, value, reading.value
                        ),
                    }
                } else {
                    Evaluation::Clear {
                        observed: reading.value,
                    }
                }
            }
            RuleKind::RateOfChange {
                window_seconds,
                roc_value,
                direction,
            } => {
                let Some(delta) = self
                    .windows
                    .get(&WindowKey::for_reading(reading))
                    .and_then(|window| window.delta_over(*window_seconds))
                else {
                    return Evaluation::Insufficient;
                };
                if direction.exceeds(delta, *roc_value) {
                    Evaluation::Breached {
                        observed: delta,
                        message: format!(
                            "{} changed by {:+} within {}s (limit {})",
                            reading.sensor, delta, window_seconds, roc_value
                        ),
                    }
                } else {
                    Evaluation::Clear { observed: delta }
                }
            }
        }
    }

    pub fn decide(
        &self,
        rule: &Rule,
        evaluation: Evaluation,
        active: Option<&ActiveAlert>,
        at: DateTime<Utc>,
    ) -> Option<AlertAction> {
        match (evaluation, active) {
            (Evaluation::Insufficient, _) => None,
            (Evaluation::Breached { observed, message }, None) => Some(AlertAction::Open {
                rule_id: rule.id,
                rule_type: rule.kind.type_label(),
                observed_value: observed,
                message,
                at,
            }),
            (Evaluation::Breached { .. }, Some(_)) => None,
            (Evaluation::Clear { .. }, None) => None,
            (Evaluation::Clear { observed }, Some(alert)) => {
                let closable = match alert.status {
                    AlertStatus::Open => true,
                    AlertStatus::Ack => self.policy.auto_close_acked,
                    AlertStatus::Closed => false,
                };
                closable.then(|| AlertAction::Close {
                    alert_id: alert.id,
                    rule_id: rule.id,
                    observed_value: observed,
                    at,
                })
            }
        }
    }

    /// Actions for every enabled rule matching the reading, in rule order.
    ///
    /// A late reading no longer describes the sensor's current value, so threshold rules skip it.
    /// Rate-of-change rules still run because the reading has joined the window.
    pub fn plan(
        &self,
        rules: &[Rule],
        reading: &Reading,
        active: &HashMap<Uuid, ActiveAlert>,
    ) -> Vec<AlertAction> {
        let late = self.is_late(reading);
        rules
            .iter()
            .filter(|rule| {
                rule.enabled
                    && rule.tenant_id == reading.tenant_id
                    && rule.asset_code == reading.asset_code
                    && rule.sensor == reading.sensor
            })
            .filter(|rule| !(late && matches!(rule.kind, RuleKind::Threshold { .. })))
            .filter_map(|rule| {
                let evaluation = self.evaluate_rule(rule, reading);
                self.decide(rule, evaluation, active.get(&rule.id), reading.timestamp)
            })
            .collect()
    }

    pub fn prune_idle(&mut self, ttl: Duration) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| window.idle_for(now) < ttl);
        self.clocks
            .retain(|_, clock| now.saturating_duration_since(clock.touched) < ttl);
        before - self.windows.len()
    }
}
