//! Relational store layer: capability ports plus their Postgres
//! implementations over a shared `PgPool`.

pub mod content;
pub mod jobs;
pub mod ports;
pub mod progress;
pub mod rollout;
pub mod schema;

use std::future::Future;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use capstan_model::{CaptureError, Result};

pub use content::PostgresContentStore;
pub use jobs::PostgresJobStore;
pub use ports::{ContentStore, JobErrorStats, JobStore, ProgressStore, RepoRef, RolloutStore};
pub use progress::PostgresProgressStore;
pub use rollout::PostgresRolloutStore;
pub use schema::ensure_schema;

/// Bounded ceiling for any single store call.
const STORE_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn connect(database_url: &str) -> Result<PgPool> {
    tracing::info!(target: "store", "connecting to Postgres");
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(STORE_TIMEOUT)
        .connect(database_url)
        .await
        .map_err(|e| CaptureError::StoreError(format!("failed to connect to Postgres: {e}")))
}

/// Map a sqlx failure into the error taxonomy. Unique-key violations are
/// reported as `StoreConflict` so upsert callers can treat them as success.
pub(crate) fn store_err(err: sqlx::Error) -> CaptureError {
    if let sqlx::Error::Database(db) = &err
        && db.code().as_deref() == Some("23505")
    {
        return CaptureError::StoreConflict;
    }
    CaptureError::StoreError(err.to_string())
}

/// Run a store future under the bounded store timeout.
pub(crate) async fn with_timeout<T, F>(fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(STORE_TIMEOUT, fut).await {
        Ok(result) => result.map_err(store_err),
        Err(_) => Err(CaptureError::Timeout(format!(
            "store call exceeded {}s",
            STORE_TIMEOUT.as_secs()
        ))),
    }
}
