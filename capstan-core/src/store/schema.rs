//! Bootstrap for the tables this crate owns. The content tables
//! (`repositories`, `pull_requests`, `reviews`, `comments`) belong to the
//! wider product schema and are assumed present.

use sqlx::PgPool;

use capstan_model::Result;

use super::store_err;

pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    tracing::info!(target: "store", "ensuring capture schema");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS progressive_capture_jobs (
            id UUID PRIMARY KEY,
            kind TEXT NOT NULL,
            repository_id UUID NOT NULL,
            repository_name TEXT NOT NULL,
            backend TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            external_run_id TEXT,
            time_range_days BIGINT,
            metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
            error TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(store_err)?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_capture_jobs_repo_status
         ON progressive_capture_jobs(repository_id, status)",
    )
    .execute(pool)
    .await
    .map_err(store_err)?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_capture_jobs_created
         ON progressive_capture_jobs(created_at)",
    )
    .execute(pool)
    .await
    .map_err(store_err)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS progressive_capture_progress (
            job_id UUID PRIMARY KEY
                REFERENCES progressive_capture_jobs(id) ON DELETE CASCADE,
            total INTEGER NOT NULL DEFAULT 0,
            processed INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            current_item TEXT,
            recent_errors JSONB NOT NULL DEFAULT '[]'::jsonb,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(store_err)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rollout_configuration (
            feature TEXT PRIMARY KEY,
            percentage SMALLINT NOT NULL DEFAULT 0,
            strategy TEXT NOT NULL DEFAULT 'percentage',
            whitelist JSONB NOT NULL DEFAULT '[]'::jsonb,
            emergency_stop BOOLEAN NOT NULL DEFAULT FALSE,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(store_err)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rollout_history (
            id UUID PRIMARY KEY,
            feature TEXT NOT NULL REFERENCES rollout_configuration(feature),
            action TEXT NOT NULL,
            previous_percentage SMALLINT NOT NULL,
            new_percentage SMALLINT NOT NULL,
            reason TEXT NOT NULL,
            triggered_by TEXT NOT NULL,
            metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(store_err)?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_rollout_history_feature
         ON rollout_history(feature, created_at DESC)",
    )
    .execute(pool)
    .await
    .map_err(store_err)?;

    Ok(())
}
