//! Tenant isolation boundary.
//!
//! Every read or write of tenant-owned rows runs inside [`run_in_tenant_scope`]: one transaction
//! with `app.tenant_id` bound transaction-locally, so the row-level policies only ever see one
//! tenant and the binding is gone once the connection returns to the pool.

use anyhow::Result;
use futures::future::BoxFuture;
use sqlx::{Connection, PgConnection, PgPool, Postgres, Transaction};
use uuid::Uuid;

const TENANT_SETTING: &str = "app.tenant_id";

#[derive(Debug, thiserror::Error)]
pub enum TenantScopeError {
    #[error("failed to begin tenant unit of work: {0}")]
    Begin(#[source] sqlx::Error),

    #[error("failed to bind tenant {tenant_id}: {source}")]
    Bind {
        tenant_id: Uuid,
        #[source]
        source: sqlx::Error,
    },

    #[error("tenant binding not visible: expected {expected}, found {found:?}")]
    Unverified {
        expected: Uuid,
        found: Option<String>,
    },
}

/// A transaction bound to exactly one tenant.
pub struct TenantTx {
    tenant_id: Uuid,
    tx: Transaction<'static, Postgres>,
}

impl TenantTx {
    /// Opens a transaction and binds it to `tenant_id`. Callers that cannot hand their work to
    /// [`run_in_tenant_scope`] as an owned closure must end the scope with `commit` or `rollback`;
    /// dropping it rolls back.
    pub async fn begin(pool: &PgPool, tenant_id: Uuid) -> Result<Self, TenantScopeError> {
        let tx = pool.begin().await.map_err(TenantScopeError::Begin)?;
        let mut scope = Self { tenant_id, tx };
        bind_tenant(&mut scope).await?;
        Ok(scope)
    }

    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    /// Nested unit of work; rolling it back leaves the enclosing scope intact.
    pub async fn savepoint(&mut self) -> Result<Transaction<'_, Postgres>> {
        let conn: &mut PgConnection = &mut self.tx;
        Ok(conn.begin().await?)
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

pub async fn run_in_tenant_scope<T, F>(pool: &PgPool, tenant_id: Uuid, work: F) -> Result<T>
where
    F: for<'c> FnOnce(&'c mut TenantTx) -> BoxFuture<'c, Result<T>>,
{
    let mut scope = TenantTx::begin(pool, tenant_id).await?;

    match work(&mut scope).await {
        Ok(value) => {
            scope.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = scope.rollback().await {
                tracing::warn!(tenant = %tenant_id, error = %rollback_err, "tenant scope rollback failed");
            }
            Err(err)
        }
    }
}

async fn bind_tenant(scope: &mut TenantTx) -> Result<(), TenantScopeError> {
    let tenant_id = scope.tenant_id;
    let bound = tenant_id.to_string();

    sqlx::query("SELECT set_config($1, $2, true)")
        .bind(TENANT_SETTING)
        .bind(&bound)
        .execute(&mut *scope.tx)
        .await
        .map_err(|source| TenantScopeError::Bind { tenant_id, source })?;

    let found: Option<String> = sqlx::query_scalar("SELECT current_setting($1, true)")
        .bind(TENANT_SETTING)
        .fetch_one(&mut *scope.tx)
        .await
        .map_err(|source| TenantScopeError::Bind { tenant_id, source })?;

    if found.as_deref() != Some(bound.as_str()) {
        return Err(TenantScopeError::Unverified {
            expected: tenant_id,
            found,
        });
    }
    Ok(())
}

/// Looks up a tenant id by slug. `tenants` is the one table read outside a tenant scope.
pub async fn resolve_tenant(pool: &PgPool, slug: &str) -> Result<Option<Uuid>> {
    let slug = slug.trim();
    if slug.is_empty() {
        return Ok(None);
    }
    let id: Option<Uuid> = sqlx::query_scalar("SELECT id FROM tenants WHERE slug = $1")
        .bind(slug)
        .fetch_optional(pool)
        .await?;
    Ok(id)
}
