use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use capstan_model::{
    BackendKind, CaptureError, CaptureJob, JobId, JobKind, JobStatus, Result,
};

use super::ports::{JobErrorStats, JobStore, RepoRef};
use super::with_timeout;

#[derive(Clone, Debug)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: PgRow) -> Result<CaptureJob> {
        let kind: String = row.try_get("kind").map_err(map_row_err)?;
        let backend: String = row.try_get("backend").map_err(map_row_err)?;
        let status: String = row.try_get("status").map_err(map_row_err)?;
        Ok(CaptureJob {
            id: JobId(row.try_get("id").map_err(map_row_err)?),
            kind: kind.parse::<JobKind>()?,
            repository_id: row.try_get("repository_id").map_err(map_row_err)?,
            repository_name: row.try_get("repository_name").map_err(map_row_err)?,
            backend: backend.parse::<BackendKind>()?,
            status: status.parse::<JobStatus>()?,
            external_run_id: row.try_get("external_run_id").map_err(map_row_err)?,
            time_range_days: row.try_get("time_range_days").map_err(map_row_err)?,
            metadata: row.try_get("metadata").map_err(map_row_err)?,
            error: row.try_get("error").map_err(map_row_err)?,
            created_at: row.try_get("created_at").map_err(map_row_err)?,
            started_at: row.try_get("started_at").map_err(map_row_err)?,
            completed_at: row.try_get("completed_at").map_err(map_row_err)?,
        })
    }
}

fn map_row_err(err: sqlx::Error) -> CaptureError {
    CaptureError::StoreError(format!("job row decode failed: {err}"))
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert_job(&self, job: &CaptureJob) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                r#"
                INSERT INTO progressive_capture_jobs
                    (id, kind, repository_id, repository_name, backend, status,
                     external_run_id, time_range_days, metadata, error,
                     created_at, started_at, completed_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(job.id.as_uuid())
            .bind(job.kind.as_str())
            .bind(job.repository_id)
            .bind(&job.repository_name)
            .bind(job.backend.as_str())
            .bind(job.status.as_str())
            .bind(&job.external_run_id)
            .bind(job.time_range_days)
            .bind(&job.metadata)
            .bind(&job.error)
            .bind(job.created_at)
            .bind(job.started_at)
            .bind(job.completed_at)
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    async fn mark_processing(&self, id: JobId) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                r#"
                UPDATE progressive_capture_jobs
                SET status = 'processing',
                    started_at = COALESCE(started_at, NOW())
                WHERE id = $1 AND status = 'pending'
                "#,
            )
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    async fn mark_completed(&self, id: JobId) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                r#"
                UPDATE progressive_capture_jobs
                SET status = 'completed',
                    completed_at = COALESCE(completed_at, NOW())
                WHERE id = $1 AND status = 'processing'
                "#,
            )
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    async fn mark_failed(&self, id: JobId, reason: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                r#"
                UPDATE progressive_capture_jobs
                SET status = 'failed',
                    error = $2,
                    completed_at = COALESCE(completed_at, NOW())
                WHERE id = $1 AND status IN ('pending', 'processing')
                "#,
            )
            .bind(id.as_uuid())
            .bind(reason)
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    async fn set_external_run_id(&self, id: JobId, run_id: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                "UPDATE progressive_capture_jobs SET external_run_id = $2 WHERE id = $1",
            )
            .bind(id.as_uuid())
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    async fn fetch_job(&self, id: JobId) -> Result<Option<CaptureJob>> {
        let row = with_timeout(async {
            sqlx::query("SELECT * FROM progressive_capture_jobs WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
        })
        .await?;
        row.map(Self::row_to_job).transpose()
    }

    async fn repository(&self, id: Uuid) -> Result<Option<RepoRef>> {
        let row = with_timeout(async {
            sqlx::query("SELECT id, owner, name, category FROM repositories WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
        })
        .await?;

        row.map(|row| {
            let category: Option<String> = row.try_get("category").map_err(map_row_err)?;
            Ok(RepoRef {
                id: row.try_get("id").map_err(map_row_err)?,
                owner: row.try_get("owner").map_err(map_row_err)?,
                name: row.try_get("name").map_err(map_row_err)?,
                category: category.as_deref().map(str::parse).transpose()?,
            })
        })
        .transpose()
    }

    async fn error_stats(&self, window: Duration) -> Result<JobErrorStats> {
        let horizon = Utc::now() - window;
        let row = with_timeout(async {
            sqlx::query(
                r#"
                SELECT
                    COUNT(*) AS total,
                    COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                    COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                    COUNT(*) FILTER (WHERE status = 'processing' AND started_at < $1)
                        AS stale_processing
                FROM progressive_capture_jobs
                WHERE created_at >= $1
                   OR (status = 'processing' AND started_at < $1)
                "#,
            )
            .bind(horizon)
            .fetch_one(&self.pool)
            .await
        })
        .await?;

        Ok(JobErrorStats {
            total: row.try_get("total").map_err(map_row_err)?,
            completed: row.try_get("completed").map_err(map_row_err)?,
            failed: row.try_get("failed").map_err(map_row_err)?,
            stale_processing: row.try_get("stale_processing").map_err(map_row_err)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_model::{JobData, TriggerSource};

    use crate::store::ensure_schema;

    fn job(kind: JobKind, backend: BackendKind) -> CaptureJob {
        let mut data = JobData::new(Uuid::new_v4(), "acme/widgets");
        data.trigger = TriggerSource::Manual;
        CaptureJob::new(kind, backend, &data)
    }

    #[sqlx::test]
    async fn job_lifecycle_round_trips(pool: PgPool) {
        ensure_schema(&pool).await.expect("schema");
        let store = PostgresJobStore::new(pool);

        let created = job(JobKind::Details, BackendKind::LowLatency);
        store.insert_job(&created).await.expect("insert");

        store.mark_processing(created.id).await.expect("processing");
        let fetched = store
            .fetch_job(created.id)
            .await
            .expect("fetch")
            .expect("exists");
        assert_eq!(fetched.status, JobStatus::Processing);
        assert!(fetched.started_at.is_some());
        assert!(fetched.completed_at.is_none());

        store.mark_completed(created.id).await.expect("completed");
        let fetched = store.fetch_job(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Completed);
        assert!(fetched.completed_at.is_some());
    }

    #[sqlx::test]
    async fn completed_jobs_do_not_regress_to_failed(pool: PgPool) {
        ensure_schema(&pool).await.expect("schema");
        let store = PostgresJobStore::new(pool);

        let created = job(JobKind::Reviews, BackendKind::Batch);
        store.insert_job(&created).await.expect("insert");
        store.mark_processing(created.id).await.expect("processing");
        store.mark_completed(created.id).await.expect("completed");

        store
            .mark_failed(created.id, "late failure")
            .await
            .expect("no-op");
        let fetched = store.fetch_job(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Completed);
        assert!(fetched.error.is_none());
    }

    #[sqlx::test]
    async fn error_stats_count_terminal_outcomes(pool: PgPool) {
        ensure_schema(&pool).await.expect("schema");
        let store = PostgresJobStore::new(pool);

        for _ in 0..3 {
            let created = job(JobKind::Details, BackendKind::LowLatency);
            store.insert_job(&created).await.expect("insert");
            store.mark_processing(created.id).await.expect("processing");
            store.mark_completed(created.id).await.expect("completed");
        }
        let failing = job(JobKind::Details, BackendKind::LowLatency);
        store.insert_job(&failing).await.expect("insert");
        store.mark_processing(failing.id).await.expect("processing");
        store.mark_failed(failing.id, "boom").await.expect("failed");

        let stats = store.error_stats(Duration::hours(24)).await.expect("stats");
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.failed, 1);
        assert!((stats.error_rate() - 0.25).abs() < 1e-9);
    }
}
