use super::Ingestor;
use crate::alert_feed::{AlertFeedItem, AlertTransition};
use crate::pipeline::IngestStats;
use crate::rules::{AlertAction, Observation, Rule, RuleEngine, WindowKey};
use crate::store::{self, AlertRecord, NewAlert};
use crate::telemetry::Reading;
use crate::tenant::TenantTx;
use anyhow::Result;
use chrono::Duration as ChronoDuration;
use sqlx::PgConnection;

#[derive(Debug, Clone)]
enum AlertChange {
    Opened(AlertRecord),
    Closed(AlertRecord),
}

impl Ingestor {
    /// Evaluates every enabled rule for the reading's (asset, sensor) in one tenant scope. Each
    /// alert change runs in its own savepoint so one failing rule does not undo the others.
    pub(in crate::ingest) async fn evaluate(
        &self,
        engine: &mut RuleEngine,
        reading: &Reading,
    ) -> Result<()> {
        engine.advance_clock(reading);
        let mut scope = TenantTx::begin(&self.pool, reading.tenant_id).await?;

        let rules = store::load_rules(
            scope.conn(),
            reading.tenant_id,
            &reading.asset_code,
            &reading.sensor,
        )
        .await?;
        if rules.is_empty() {
            scope.commit().await?;
            // A cached window keeps following the sensor while its rules are disabled.
            observe_cached(engine, reading);
            return Ok(());
        }

        self.prepare_window(&mut scope, engine, &rules, reading).await?;

        let rule_ids: Vec<_> = rules.iter().map(|rule| rule.id).collect();
        let active =
            store::active_alerts_for_rules(scope.conn(), reading.tenant_id, &rule_ids).await?;
        let actions = engine.plan(&rules, reading, &active);

        let mut changes = Vec::with_capacity(actions.len());
        for action in actions {
            let rule_id = action.rule_id();
            let mut savepoint = scope.savepoint().await?;
            match apply_action(&mut savepoint, reading, action).await {
                Ok(change) => {
                    savepoint.commit().await?;
                    changes.extend(change);
                }
                Err(err) => {
                    if let Err(rollback_err) = savepoint.rollback().await {
                        tracing::warn!(error = %rollback_err, "savepoint rollback failed");
                    }
                    IngestStats::incr(&self.stats.rule_failures);
                    tracing::warn!(rule_id = %rule_id, error = %err, "skipping rule for reading");
                }
            }
        }

        scope.commit().await?;
        self.publish_changes(changes);
        Ok(())
    }

    /// Seeds the window from storage when it is cold or narrower than the rules need, otherwise
    /// feeds it the reading. A seed already contains the reading, which is committed by now.
    async fn prepare_window(
        &self,
        scope: &mut TenantTx,
        engine: &mut RuleEngine,
        rules: &[Rule],
        reading: &Reading,
    ) -> Result<()> {
        let key = WindowKey::for_reading(reading);
        let Some(retention) = engine.needs_seed(&key, rules) else {
            observe_cached(engine, reading);
            return Ok(());
        };

        let latest = store::latest_timestamp(
            scope.conn(),
            reading.tenant_id,
            &reading.asset_code,
            &reading.sensor,
        )
        .await?
        .unwrap_or(reading.timestamp);
        let from = latest - ChronoDuration::seconds(retention);
        let points = store::readings_in_window(
            scope.conn(),
            reading.tenant_id,
            &reading.asset_code,
            &reading.sensor,
            from,
            latest,
        )
        .await?;
        tracing::debug!(
            asset = %reading.asset_code,
            sensor = %reading.sensor,
            retention,
            points = points.len(),
            "seeded rate-of-change window"
        );
        engine.seed(key, retention, points);
        Ok(())
    }

    fn publish_changes(&self, changes: Vec<AlertChange>) {
        for change in changes {
            let (transition, alert) = match change {
                AlertChange::Opened(alert) => {
                    IngestStats::incr(&self.stats.alerts_opened);
                    (AlertTransition::Opened, alert)
                }
                AlertChange::Closed(alert) => {
                    IngestStats::incr(&self.stats.alerts_closed);
                    (AlertTransition::Closed, alert)
                }
            };
            tracing::info!(
                alert_id = %alert.id,
                rule_id = %alert.rule_id,
                asset = %alert.asset_code,
                sensor = %alert.sensor,
                transition = transition.as_str(),
                "alert {}",
                transition.as_str()
            );
            if let Some(feed) = &self.alert_feed {
                feed.enqueue(AlertFeedItem::new(transition, &alert));
            }
        }
    }
}

fn observe_cached(engine: &mut RuleEngine, reading: &Reading) {
    if let Some(Observation::BeyondFloor) = engine.observe(reading) {
        tracing::debug!(
            asset = %reading.asset_code,
            sensor = %reading.sensor,
            ts = %reading.timestamp,
            "reading older than rate-of-change window"
        );
    }
}

async fn apply_action(
    conn: &mut PgConnection,
    reading: &Reading,
    action: AlertAction,
) -> Result<Option<AlertChange>> {
    match action {
        AlertAction::Open {
            rule_id,
            rule_type,
            observed_value,
            message,
            at,
        } => {
            let created = store::create_alert(
                conn,
                &NewAlert {
                    tenant_id: reading.tenant_id,
                    rule_id,
                    asset_code: &reading.asset_code,
                    sensor: &reading.sensor,
                    rule_type,
                    message: &message,
                    observed_value,
                    at,
                },
            )
            .await?;
            Ok(created.map(AlertChange::Opened))
        }
        AlertAction::Close {
            alert_id,
            observed_value,
            at,
            ..
        } => {
            let closed =
                store::close_alert_by_engine(conn, reading.tenant_id, alert_id, observed_value, at)
                    .await?;
            Ok(closed.map(AlertChange::Closed))
        }
    }
}
