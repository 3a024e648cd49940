use std::time::Duration;

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, Statement};

use super::catalog::CatalogError;

/// Upper bound on a reconciliation pass; the pinned session must outlive it.
const SESSION_LIFETIME: Duration = Duration::from_secs(6 * 60 * 60);

/// Session-scoped Postgres advisory lock held for the duration of a
/// reconciliation pass. Replicas starting together queue on it. If the
/// process dies the server drops the session and the lock with it.
///
/// The lock lives on its own single-connection pool opened from the same URL
/// as the application pool, so TLS and other URL options apply unchanged.
pub struct SchemaLock {
    db: DatabaseConnection,
    key: i64,
}

/// One pinned session that the pool never recycles mid-pass.
pub fn lock_connect_options(database_url: &str) -> ConnectOptions {
    let mut options = ConnectOptions::new(database_url);
    options
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(SESSION_LIFETIME)
        .max_lifetime(SESSION_LIFETIME)
        .sqlx_logging(false);
    options
}

impl SchemaLock {
    pub async fn acquire(database_url: &str, key: i64) -> Result<Self, CatalogError> {
        let db = Database::connect(lock_connect_options(database_url))
            .await
            .map_err(|e| CatalogError::Connect(e.to_string()))?;

        tracing::info!(key, "waiting for schema advisory lock");
        db.execute(advisory("SELECT pg_advisory_lock($1)", key)).await?;
        tracing::info!(key, "schema advisory lock acquired");

        Ok(Self { db, key })
    }

    pub async fn release(self) -> Result<(), CatalogError> {
        let result = self
            .db
            .execute(advisory("SELECT pg_advisory_unlock($1)", self.key))
            .await;
        // Closing ends the session, which drops the lock even if unlock failed.
        if let Err(e) = self.db.close().await {
            tracing::warn!(error = %e, "failed to close schema lock session");
        }
        result?;
        tracing::info!(key = self.key, "schema advisory lock released");
        Ok(())
    }
}

fn advisory(sql: &str, key: i64) -> Statement {
    Statement::from_sql_and_values(DbBackend::Postgres, sql, [key.into()])
}
