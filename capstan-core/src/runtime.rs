//! Explicit wiring for the whole capture stack. Construction is the only
//! place dependencies meet; nothing in here is a global.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;

use capstan_model::{CaptureError, Result};

use crate::capture::CaptureContext;
use crate::forge::ForgeReader;
use crate::governor::RateLimitGovernor;
use crate::rollout::RolloutController;
use crate::router::{
    BatchBackend, CapturePool, LowLatencyBackend, MAX_CONCURRENT_JOBS, Router, WorkflowDispatcher,
};
use crate::store::ports::{ContentStore, JobStore, ProgressStore, RolloutStore};
use crate::store::{
    PostgresContentStore, PostgresJobStore, PostgresProgressStore, PostgresRolloutStore,
};

/// Stands in when no batch job runner is configured; the router's retry
/// surfaces this as `BackendUnavailable`.
struct UnconfiguredDispatcher;

#[async_trait]
impl WorkflowDispatcher for UnconfiguredDispatcher {
    async fn dispatch(&self, _workflow: &str, _inputs: &HashMap<String, String>) -> Result<String> {
        Err(CaptureError::BackendUnavailable(
            "no batch job runner configured".to_string(),
        ))
    }
}

pub struct CaptureRuntime {
    pub router: Router,
    pub rollout: Arc<RolloutController>,
    pub governor: Arc<RateLimitGovernor>,
    pool: Arc<CapturePool>,
}

impl std::fmt::Debug for CaptureRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureRuntime").finish_non_exhaustive()
    }
}

impl CaptureRuntime {
    pub fn builder() -> CaptureRuntimeBuilder {
        CaptureRuntimeBuilder::default()
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

#[derive(Default)]
pub struct CaptureRuntimeBuilder {
    forge: Option<Arc<dyn ForgeReader>>,
    jobs: Option<Arc<dyn JobStore>>,
    progress: Option<Arc<dyn ProgressStore>>,
    content: Option<Arc<dyn ContentStore>>,
    rollout_store: Option<Arc<dyn RolloutStore>>,
    dispatcher: Option<Arc<dyn WorkflowDispatcher>>,
    governor: Option<Arc<RateLimitGovernor>>,
    concurrency: Option<usize>,
    feature: Option<String>,
}

impl CaptureRuntimeBuilder {
    /// Use the Postgres store implementations over one shared pool.
    pub fn with_postgres(self, pool: PgPool) -> Self {
        self.with_jobs(Arc::new(PostgresJobStore::new(pool.clone())))
            .with_progress(Arc::new(PostgresProgressStore::new(pool.clone())))
            .with_content(Arc::new(PostgresContentStore::new(pool.clone())))
            .with_rollout_store(Arc::new(PostgresRolloutStore::new(pool)))
    }

    pub fn with_forge(mut self, forge: Arc<dyn ForgeReader>) -> Self {
        self.forge = Some(forge);
        self
    }

    pub fn with_jobs(mut self, jobs: Arc<dyn JobStore>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressStore>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_content(mut self, content: Arc<dyn ContentStore>) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_rollout_store(mut self, store: Arc<dyn RolloutStore>) -> Self {
        self.rollout_store = Some(store);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn WorkflowDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_governor(mut self, governor: Arc<RateLimitGovernor>) -> Self {
        self.governor = Some(governor);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.feature = Some(feature.into());
        self
    }

    pub fn build(self) -> Result<CaptureRuntime> {
        let forge = self
            .forge
            .ok_or_else(|| CaptureError::Config("forge reader missing".into()))?;
        let jobs = self
            .jobs
            .ok_or_else(|| CaptureError::Config("job store missing".into()))?;
        let progress = self
            .progress
            .ok_or_else(|| CaptureError::Config("progress store missing".into()))?;
        let content = self
            .content
            .ok_or_else(|| CaptureError::Config("content store missing".into()))?;
        let rollout_store = self
            .rollout_store
            .ok_or_else(|| CaptureError::Config("rollout store missing".into()))?;

        let governor = self.governor.unwrap_or_default();
        let rollout = Arc::new(RolloutController::new(rollout_store));

        let ctx = CaptureContext {
            forge,
            jobs: Arc::clone(&jobs),
            progress,
            content,
        };
        let pool = CapturePool::start(ctx, self.concurrency.unwrap_or(MAX_CONCURRENT_JOBS));

        let dispatcher = self
            .dispatcher
            .unwrap_or_else(|| Arc::new(UnconfiguredDispatcher));

        let mut router = Router::new(
            jobs,
            Arc::clone(&rollout),
            Arc::new(LowLatencyBackend::new(Arc::clone(&pool))),
            Arc::new(BatchBackend::new(dispatcher)),
        );
        if let Some(feature) = self.feature {
            router = router.with_feature(feature);
        }

        Ok(CaptureRuntime {
            router,
            rollout,
            governor,
            pool,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    use capstan_model::{
        DEFAULT_FEATURE, JobData, JobKind, JobStatus, TriggerSource,
    };

    use crate::rollout::testing::InMemoryRolloutStore;
    use crate::testing::{
        InMemoryContentStore, InMemoryJobStore, InMemoryProgressStore, ScriptedForge, repo_ref,
    };

    #[tokio::test]
    async fn built_runtime_routes_and_executes_end_to_end() {
        let jobs = Arc::new(InMemoryJobStore::default());
        let repo_id = Uuid::new_v4();
        jobs.add_repository(repo_ref(repo_id)).await;

        let runtime = CaptureRuntime::builder()
            .with_forge(Arc::new(ScriptedForge::default()))
            .with_jobs(Arc::clone(&jobs) as _)
            .with_progress(Arc::new(InMemoryProgressStore::default()))
            .with_content(Arc::new(InMemoryContentStore::default()))
            .with_rollout_store(Arc::new(InMemoryRolloutStore::default()))
            .with_concurrency(2)
            .build()
            .unwrap();

        runtime
            .rollout
            .update(DEFAULT_FEATURE, 100, "open")
            .await
            .unwrap();

        let mut data = JobData::new(repo_id, "acme/widgets");
        data.pr_numbers = vec![42];
        data.trigger = TriggerSource::Manual;

        let job = runtime.router.enqueue(JobKind::Details, data).await.unwrap();

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if let Some(stored) = jobs.job(job.id).await
                && stored.status == JobStatus::Completed
            {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "job never completed");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        runtime.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn missing_dispatcher_surfaces_backend_unavailable_for_batch() {
        let jobs = Arc::new(InMemoryJobStore::default());
        let repo_id = Uuid::new_v4();
        jobs.add_repository(repo_ref(repo_id)).await;

        let runtime = CaptureRuntime::builder()
            .with_forge(Arc::new(ScriptedForge::default()))
            .with_jobs(Arc::clone(&jobs) as _)
            .with_progress(Arc::new(InMemoryProgressStore::default()))
            .with_content(Arc::new(InMemoryContentStore::default()))
            .with_rollout_store(Arc::new(InMemoryRolloutStore::default()))
            .build()
            .unwrap();

        runtime
            .rollout
            .update(DEFAULT_FEATURE, 100, "open")
            .await
            .unwrap();

        let mut data = JobData::new(repo_id, "acme/widgets");
        data.time_range_days = Some(180);
        let err = runtime
            .router
            .enqueue(JobKind::HistoricalSync, data)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::BackendUnavailable(_)));

        runtime.shutdown().await;
    }

    #[test]
    fn builder_rejects_missing_pieces() {
        let err = CaptureRuntime::builder().build().unwrap_err();
        assert!(matches!(err, CaptureError::Config(_)));
    }
}
