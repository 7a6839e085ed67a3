//! Tenant-scoped persistence. Every function here expects a connection that is already inside a
//! tenant scope; queries still filter on `tenant_id` explicitly.

mod alerts;
mod devices;
mod readings;
mod rules;

pub use alerts::{
    active_alerts_for_rules, close_alert_by_engine, create_alert, list_active_alerts,
    transition_alert, AlertRecord, AlertTransitionError, NewAlert, OperatorTransition,
};
pub use devices::{find_device, touch_device};
pub use readings::{
    insert_reading, latest_timestamp, query_readings, readings_in_window, ReadingsQuery,
    SeriesPoint,
};
pub use rules::load_rules;

use anyhow::{Context, Result};
use sqlx::PgPool;

const SCHEMA_SQL: &str = include_str!("../schema/condition_monitor.sql");

pub async fn apply_schema(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA_SQL)
        .execute(pool)
        .await
        .context("failed to apply condition monitor schema")?;
    tracing::info!("condition monitor schema applied");
    Ok(())
}
