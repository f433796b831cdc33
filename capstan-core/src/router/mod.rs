//! Hybrid router: classifies each capture request, consults the rollout
//! gate, writes the job row and dispatches to a back-end.

pub mod backends;
pub mod classifier;
pub mod pool;

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use capstan_model::{
    BackendKind, CaptureError, CaptureJob, JobData, JobId, JobKind, Result, DEFAULT_FEATURE,
};

use crate::rollout::RolloutController;
use crate::store::ports::JobStore;

pub use backends::{
    BackendReceipt, BatchBackend, CaptureBackend, HttpWorkflowDispatcher, LowLatencyBackend,
    WorkflowDispatcher,
};
pub use classifier::{Classification, classify};
pub use pool::{CapturePool, MAX_CONCURRENT_JOBS};

/// Wait before the single same-back-end retry on refusal.
const DISPATCH_RETRY_WAIT: Duration = Duration::from_millis(500);

pub struct Router {
    jobs: Arc<dyn JobStore>,
    rollout: Arc<RolloutController>,
    low_latency: Arc<dyn CaptureBackend>,
    batch: Arc<dyn CaptureBackend>,
    feature: String,
}

impl Router {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        rollout: Arc<RolloutController>,
        low_latency: Arc<dyn CaptureBackend>,
        batch: Arc<dyn CaptureBackend>,
    ) -> Self {
        Self {
            jobs,
            rollout,
            low_latency,
            batch,
            feature: DEFAULT_FEATURE.to_string(),
        }
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.feature = feature.into();
        self
    }

    /// Create and dispatch a capture job. Returns once the job row exists
    /// and a back-end has accepted it — never waits for the work itself.
    pub async fn enqueue(&self, kind: JobKind, data: JobData) -> Result<CaptureJob> {
        if self.jobs.repository(data.repository_id).await?.is_none() {
            return Err(CaptureError::InvalidArgument(format!(
                "unknown repository {}",
                data.repository_id
            )));
        }

        let hybrid_active = self.gate(data.repository_id).await;
        let classification = classifier::classify(&data);
        let backend_kind = if hybrid_active {
            classification.backend
        } else {
            // Gate closed: hybrid routing is off, everything rides the
            // low-latency path.
            BackendKind::LowLatency
        };

        let mut job = CaptureJob::new(kind, backend_kind, &data);
        self.jobs.insert_job(&job).await?;

        tracing::info!(
            target: "router",
            job = %job.id,
            kind = %kind,
            backend = %backend_kind,
            reason = ?classification.reason,
            hybrid_active,
            "capture job created"
        );

        let receipt = match self.dispatch(backend_kind, &job, &data).await {
            Ok(receipt) => receipt,
            Err(err) => {
                self.jobs
                    .mark_failed(job.id, &format!("dispatch failed: {err}"))
                    .await?;
                return Err(err);
            }
        };

        if let Some(run_id) = receipt.external_run_id {
            self.jobs.set_external_run_id(job.id, &run_id).await?;
            job.external_run_id = Some(run_id);
        }
        Ok(job)
    }

    /// Cancel a job through whichever back-end owns it.
    pub async fn cancel(&self, job_id: JobId) -> Result<()> {
        let job = self
            .jobs
            .fetch_job(job_id)
            .await?
            .ok_or_else(|| CaptureError::NotFound(format!("job {job_id}")))?;
        self.backend(job.backend).cancel(job_id).await
    }

    /// One refusal is retried against the same back-end after a short
    /// wait; there is no cross-dispatch between back-ends.
    async fn dispatch(
        &self,
        backend_kind: BackendKind,
        job: &CaptureJob,
        data: &JobData,
    ) -> Result<BackendReceipt> {
        let backend = self.backend(backend_kind);
        match backend.accept(job, data).await {
            Ok(receipt) => Ok(receipt),
            Err(first) => {
                tracing::warn!(
                    target: "router",
                    job = %job.id,
                    backend = %backend_kind,
                    error = %first,
                    "back-end refused dispatch, retrying once"
                );
                tokio::time::sleep(DISPATCH_RETRY_WAIT).await;
                backend.accept(job, data).await.map_err(|second| {
                    CaptureError::BackendUnavailable(format!(
                        "{backend_kind} back-end refused twice: {second}"
                    ))
                })
            }
        }
    }

    fn backend(&self, kind: BackendKind) -> &Arc<dyn CaptureBackend> {
        match kind {
            BackendKind::LowLatency => &self.low_latency,
            BackendKind::Batch => &self.batch,
        }
    }

    /// Gate failures close the gate rather than failing the enqueue; the
    /// low-latency path is always a safe landing.
    async fn gate(&self, repository_id: Uuid) -> bool {
        match self.rollout.is_allowed(&self.feature, repository_id).await {
            Ok(allowed) => allowed,
            Err(err) => {
                tracing::warn!(
                    target: "router",
                    error = %err,
                    "rollout gate read failed, treating as closed"
                );
                false
            }
        }
    }
}
