use async_trait::async_trait;
use sqlx::{PgPool, Row};

use capstan_model::{CaptureError, CaptureProgress, JobId, ProgressError, Result};

use super::ports::ProgressStore;
use super::with_timeout;

#[derive(Clone, Debug)]
pub struct PostgresProgressStore {
    pool: PgPool,
}

impl PostgresProgressStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProgressStore for PostgresProgressStore {
    async fn upsert(&self, progress: &CaptureProgress) -> Result<()> {
        let recent_errors = serde_json::to_value(&progress.recent_errors)?;
        with_timeout(async {
            sqlx::query(
                r#"
                INSERT INTO progressive_capture_progress
                    (job_id, total, processed, failed, current_item, recent_errors, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (job_id) DO UPDATE
                SET total = EXCLUDED.total,
                    processed = GREATEST(progressive_capture_progress.processed, EXCLUDED.processed),
                    failed = GREATEST(progressive_capture_progress.failed, EXCLUDED.failed),
                    current_item = EXCLUDED.current_item,
                    recent_errors = EXCLUDED.recent_errors,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(progress.job_id.as_uuid())
            .bind(progress.total as i32)
            .bind(progress.processed as i32)
            .bind(progress.failed as i32)
            .bind(&progress.current_item)
            .bind(recent_errors)
            .bind(progress.updated_at)
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    async fn fetch(&self, job_id: JobId) -> Result<Option<CaptureProgress>> {
        let row = with_timeout(async {
            sqlx::query("SELECT * FROM progressive_capture_progress WHERE job_id = $1")
                .bind(job_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
        })
        .await?;

        row.map(|row| {
            let decode = |e: sqlx::Error| {
                CaptureError::StoreError(format!("progress row decode failed: {e}"))
            };
            let recent: serde_json::Value = row.try_get("recent_errors").map_err(decode)?;
            let recent_errors: Vec<ProgressError> = serde_json::from_value(recent)?;
            Ok(CaptureProgress {
                job_id: JobId(row.try_get("job_id").map_err(decode)?),
                total: row.try_get::<i32, _>("total").map_err(decode)? as u32,
                processed: row.try_get::<i32, _>("processed").map_err(decode)? as u32,
                failed: row.try_get::<i32, _>("failed").map_err(decode)? as u32,
                current_item: row.try_get("current_item").map_err(decode)?,
                recent_errors,
                updated_at: row.try_get("updated_at").map_err(decode)?,
            })
        })
        .transpose()
    }
}
