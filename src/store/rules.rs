use crate::rules::{parse_rule_kind, Rule, RuleSpec};
use anyhow::Result;
use sqlx::{FromRow, PgConnection};
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
struct RuleRow {
    id: Uuid,
    tenant_id: Uuid,
    asset_code: String,
    sensor: String,
    name: String,
    rule_type: String,
    operator: Option<String>,
    value: Option<f64>,
    window_seconds: Option<i32>,
    roc_value: Option<f64>,
    roc_direction: Option<String>,
    enabled: bool,
}

/// Enabled rules for one (asset, sensor). Rows that fail validation are logged and left out.
pub async fn load_rules(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    asset_code: &str,
    sensor: &str,
) -> Result<Vec<Rule>> {
    let rows: Vec<RuleRow> = sqlx::query_as(
        r#"
        SELECT
            id,
            tenant_id,
            asset_code,
            sensor,
            name,
            rule_type,
            operator,
            value,
            window_seconds,
            roc_value,
            roc_direction,
            enabled
        FROM rules
        WHERE tenant_id = $1
          AND asset_code = $2
          AND sensor = $3
          AND enabled = TRUE
        ORDER BY id ASC
        "#,
    )
    .bind(tenant_id)
    .bind(asset_code)
    .bind(sensor)
    .fetch_all(conn)
    .await?;

    let mut rules = Vec::with_capacity(rows.len());
    for row in rows {
        let spec = RuleSpec {
            rule_type: &row.rule_type,
            operator: row.operator.as_deref(),
            value: row.value,
            window_seconds: row.window_seconds.map(i64::from),
            roc_value: row.roc_value,
            roc_direction: row.roc_direction.as_deref(),
        };
        let kind = match parse_rule_kind(&spec) {
            Ok(kind) => kind,
            Err(err) => {
                tracing::warn!(rule_id = %row.id, error = %err, "skipping invalid rule");
                continue;
            }
        };
        rules.push(Rule {
            id: row.id,
            tenant_id: row.tenant_id,
            asset_code: row.asset_code,
            sensor: row.sensor,
            name: row.name,
            enabled: row.enabled,
            kind,
        });
    }
    Ok(rules)
}
