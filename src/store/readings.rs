use crate::rules::WindowPoint;
use crate::telemetry::Reading;
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection};
use uuid::Uuid;

const DEFAULT_QUERY_LIMIT: i64 = 10_000;
const MAX_QUERY_LIMIT: i64 = 100_000;

pub async fn insert_reading(conn: &mut PgConnection, reading: &Reading) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO readings (tenant_id, asset_code, sensor, ts, value, provenance, received_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(reading.tenant_id)
    .bind(&reading.asset_code)
    .bind(&reading.sensor)
    .bind(reading.timestamp)
    .bind(reading.value)
    .bind(reading.provenance.as_str())
    .bind(reading.received_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn latest_timestamp(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    asset_code: &str,
    sensor: &str,
) -> Result<Option<DateTime<Utc>>> {
    let latest: Option<DateTime<Utc>> = sqlx::query_scalar(
        r#"
        SELECT max(ts)
        FROM readings
        WHERE tenant_id = $1 AND asset_code = $2 AND sensor = $3
        "#,
    )
    .bind(tenant_id)
    .bind(asset_code)
    .bind(sensor)
    .fetch_one(conn)
    .await?;
    Ok(latest)
}

/// Readings with `from <= ts <= to`, oldest first.
pub async fn readings_in_window(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    asset_code: &str,
    sensor: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<WindowPoint>> {
    let rows: Vec<(DateTime<Utc>, f64)> = sqlx::query_as(
        r#"
        SELECT ts, value
        FROM readings
        WHERE tenant_id = $1
          AND asset_code = $2
          AND sensor = $3
          AND ts >= $4
          AND ts <= $5
        ORDER BY ts ASC
        "#,
    )
    .bind(tenant_id)
    .bind(asset_code)
    .bind(sensor)
    .bind(from)
    .bind(to)
    .fetch_all(conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(timestamp, value)| WindowPoint { timestamp, value })
        .collect())
}

#[derive(Debug, Clone)]
pub struct ReadingsQuery {
    pub tenant_id: Uuid,
    pub asset_code: String,
    pub sensor: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// `None` returns raw readings.
    pub bucket_seconds: Option<u32>,
    pub limit: Option<u32>,
}

/// A raw reading or one time bucket. Raw points carry `min == max == value` and one sample.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct SeriesPoint {
    pub ts: DateTime<Utc>,
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub samples: i64,
    pub provenance: Option<String>,
}

pub async fn query_readings(
    conn: &mut PgConnection,
    query: &ReadingsQuery,
) -> Result<Vec<SeriesPoint>> {
    if query.to < query.from {
        bail!("query range ends before it starts");
    }
    let limit = query
        .limit
        .map(i64::from)
        .filter(|limit| *limit > 0)
        .unwrap_or(DEFAULT_QUERY_LIMIT)
        .min(MAX_QUERY_LIMIT);

    let points: Vec<SeriesPoint> = match query.bucket_seconds.filter(|secs| *secs > 0) {
        None => {
            sqlx::query_as(
                r#"
                SELECT ts,
                       value,
                       value AS min,
                       value AS max,
                       1::bigint AS samples,
                       provenance
                FROM readings
                WHERE tenant_id = $1
                  AND asset_code = $2
                  AND sensor = $3
                  AND ts >= $4
                  AND ts <= $5
                ORDER BY ts ASC
                LIMIT $6
                "#,
            )
            .bind(query.tenant_id)
            .bind(&query.asset_code)
            .bind(&query.sensor)
            .bind(query.from)
            .bind(query.to)
            .bind(limit)
            .fetch_all(conn)
            .await?
        }
        Some(bucket_seconds) => {
            sqlx::query_as(
                r#"
                SELECT date_bin(make_interval(secs => $6), ts, $4) AS ts,
                       avg(value) AS value,
                       min(value) AS min,
                       max(value) AS max,
                       count(*) AS samples,
                       NULL::text AS provenance
                FROM readings
                WHERE tenant_id = $1
                  AND asset_code = $2
                  AND sensor = $3
                  AND ts >= $4
                  AND ts <= $5
                GROUP BY 1
                ORDER BY 1 ASC
                LIMIT $7
                "#,
            )
            .bind(query.tenant_id)
            .bind(&query.asset_code)
            .bind(&query.sensor)
            .bind(query.from)
            .bind(query.to)
            .bind(f64::from(bucket_seconds))
            .bind(limit)
            .fetch_all(conn)
            .await?
        }
    };
    Ok(points)
}
