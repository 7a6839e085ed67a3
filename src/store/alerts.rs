use crate::rules::{ActiveAlert, AlertStatus};
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection};
use std::collections::HashMap;
use uuid::Uuid;

/// Recorded in `closed_by` when recovery closes an alert.
pub const ENGINE_ACTOR: &str = "engine";

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct AlertRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub rule_id: Uuid,
    pub asset_code: String,
    pub sensor: String,
    pub rule_type: String,
    pub message: String,
    pub status: String,
    pub observed_value: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub acked_by: Option<String>,
    pub closed_by: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAlert<'a> {
    pub tenant_id: Uuid,
    pub rule_id: Uuid,
    pub asset_code: &'a str,
    pub sensor: &'a str,
    pub rule_type: &'a str,
    pub message: &'a str,
    pub observed_value: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorTransition {
    Ack,
    Close,
}

impl OperatorTransition {
    fn target(self) -> AlertStatus {
        match self {
            OperatorTransition::Ack => AlertStatus::Ack,
            OperatorTransition::Close => AlertStatus::Closed,
        }
    }

    fn allowed_from(self, current: AlertStatus) -> bool {
        match self {
            OperatorTransition::Ack => current == AlertStatus::Open,
            OperatorTransition::Close => current.is_active(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AlertTransitionError {
    #[error("alert {0} not found")]
    NotFound(Uuid),

    #[error("alert {id} cannot move from {from} to {to}")]
    NotAllowed {
        id: Uuid,
        from: String,
        to: AlertStatus,
    },

    #[error("operator name is required")]
    MissingOperator,

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

const ALERT_COLUMNS: &str = "id, tenant_id, rule_id, asset_code, sensor, rule_type, message, status, \
     observed_value, created_at, updated_at, acked_by, closed_by";

pub async fn active_alerts_for_rules(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    rule_ids: &[Uuid],
) -> Result<HashMap<Uuid, ActiveAlert>> {
    if rule_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let rows: Vec<(Uuid, Uuid, String)> = sqlx::query_as(
        r#"
        SELECT id, rule_id, status
        FROM alerts
        WHERE tenant_id = $1
          AND rule_id = ANY($2)
          AND status IN ('OPEN', 'ACK')
        "#,
    )
    .bind(tenant_id)
    .bind(rule_ids)
    .fetch_all(conn)
    .await?;

    let mut active = HashMap::with_capacity(rows.len());
    for (id, rule_id, status) in rows {
        let Some(status) = AlertStatus::parse(&status) else {
            tracing::warn!(alert_id = %id, status = %status, "ignoring alert with unknown status");
            continue;
        };
        active.insert(
            rule_id,
            ActiveAlert {
                id,
                rule_id,
                status,
            },
        );
    }
    Ok(active)
}

/// Inserts an OPEN alert unless the rule already has an active one. Returns `None` on conflict.
pub async fn create_alert(
    conn: &mut PgConnection,
    alert: &NewAlert<'_>,
) -> Result<Option<AlertRecord>> {
    let sql = format!(
        r#"
        INSERT INTO alerts (
            id, tenant_id, rule_id, asset_code, sensor, rule_type, message, status,
            observed_value, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, 'OPEN', $8, $9, $9)
        ON CONFLICT (rule_id) WHERE status IN ('OPEN', 'ACK') DO NOTHING
        RETURNING {ALERT_COLUMNS}
        "#
    );
    let created: Option<AlertRecord> = sqlx::query_as(&sql)
        .bind(Uuid::new_v4())
        .bind(alert.tenant_id)
        .bind(alert.rule_id)
        .bind(alert.asset_code)
        .bind(alert.sensor)
        .bind(alert.rule_type)
        .bind(alert.message)
        .bind(alert.observed_value)
        .bind(alert.at)
        .fetch_optional(conn)
        .await?;
    Ok(created)
}

/// Closes an active alert on recovery. Returns `None` if it was no longer active.
pub async fn close_alert_by_engine(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    alert_id: Uuid,
    observed_value: f64,
    at: DateTime<Utc>,
) -> Result<Option<AlertRecord>> {
    let sql = format!(
        r#"
        UPDATE alerts
        SET status = 'CLOSED',
            observed_value = $3,
            updated_at = $4,
            closed_by = $5
        WHERE tenant_id = $1
          AND id = $2
          AND status IN ('OPEN', 'ACK')
        RETURNING {ALERT_COLUMNS}
        "#
    );
    let closed: Option<AlertRecord> = sqlx::query_as(&sql)
        .bind(tenant_id)
        .bind(alert_id)
        .bind(observed_value)
        .bind(at)
        .bind(ENGINE_ACTOR)
        .fetch_optional(conn)
        .await?;
    Ok(closed)
}

pub async fn list_active_alerts(
    conn: &mut PgConnection,
    tenant_id: Uuid,
) -> Result<Vec<AlertRecord>> {
    let sql = format!(
        r#"
        SELECT {ALERT_COLUMNS}
        FROM alerts
        WHERE tenant_id = $1
          AND status IN ('OPEN', 'ACK')
        ORDER BY created_at DESC, id ASC
        "#
    );
    let rows: Vec<AlertRecord> = sqlx::query_as(&sql)
        .bind(tenant_id)
        .fetch_all(conn)
        .await?;
    Ok(rows)
}

/// Operator acknowledgement or close. The only status changes not made by the rule engine.
pub async fn transition_alert(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    alert_id: Uuid,
    transition: OperatorTransition,
    operator: &str,
    at: DateTime<Utc>,
) -> Result<AlertRecord, AlertTransitionError> {
    let operator = operator.trim();
    if operator.is_empty() {
        return Err(AlertTransitionError::MissingOperator);
    }

    let current: Option<String> = sqlx::query_scalar(
        r#"
        SELECT status
        FROM alerts
        WHERE tenant_id = $1 AND id = $2
        FOR UPDATE
        "#,
    )
    .bind(tenant_id)
    .bind(alert_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(current) = current else {
        return Err(AlertTransitionError::NotFound(alert_id));
    };
    let target = transition.target();
    let allowed = AlertStatus::parse(&current)
        .map(|status| transition.allowed_from(status))
        .unwrap_or(false);
    if !allowed {
        return Err(AlertTransitionError::NotAllowed {
            id: alert_id,
            from: current,
            to: target,
        });
    }

    let sql = format!(
        r#"
        UPDATE alerts
        SET status = $3,
            updated_at = $4,
            acked_by = CASE WHEN $3 = 'ACK' THEN $5 ELSE acked_by END,
            closed_by = CASE WHEN $3 = 'CLOSED' THEN $5 ELSE closed_by END
        WHERE tenant_id = $1 AND id = $2
        RETURNING {ALERT_COLUMNS}
        "#
    );
    let updated: AlertRecord = sqlx::query_as(&sql)
        .bind(tenant_id)
        .bind(alert_id)
        .bind(target.as_str())
        .bind(at)
        .bind(operator)
        .fetch_one(conn)
        .await?;
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_transitions_follow_lifecycle() {
        assert!(OperatorTransition::Ack.allowed_from(AlertStatus::Open));
        assert!(!OperatorTransition::Ack.allowed_from(AlertStatus::Ack));
        assert!(!OperatorTransition::Ack.allowed_from(AlertStatus::Closed));
        assert!(OperatorTransition::Close.allowed_from(AlertStatus::Open));
        assert!(OperatorTransition::Close.allowed_from(AlertStatus::Ack));
        assert!(!OperatorTransition::Close.allowed_from(AlertStatus::Closed));
    }
}
