use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection};
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
pub struct DeviceRecord {
    pub ingest_key_sha256: Option<String>,
}

pub async fn find_device(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    code: &str,
) -> Result<Option<DeviceRecord>> {
    let row: Option<DeviceRecord> = sqlx::query_as(
        r#"
        SELECT ingest_key_sha256
        FROM devices
        WHERE tenant_id = $1 AND code = $2
        "#,
    )
    .bind(tenant_id)
    .bind(code)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

/// Advances `last_seen_at` (never backwards) and, when given, replaces `last_state`.
pub async fn touch_device(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    code: &str,
    seen_at: DateTime<Utc>,
    state: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE devices
        SET last_seen_at = GREATEST(COALESCE(last_seen_at, $3), $3),
            last_state = COALESCE($4, last_state)
        WHERE tenant_id = $1 AND code = $2
        "#,
    )
    .bind(tenant_id)
    .bind(code)
    .bind(seen_at)
    .bind(state)
    .execute(conn)
    .await?;
    Ok(())
}
