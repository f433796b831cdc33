//! The low-latency back-end's worker pool: a fixed set of workers
//! draining a bounded queue, one job per worker at a time, items
//! sequential inside each job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use capstan_model::{CaptureError, CaptureJob, JobData, JobId, Result};

use crate::capture::{CaptureContext, CaptureWorker};

/// Hard ceiling on simultaneous jobs per process.
pub const MAX_CONCURRENT_JOBS: usize = 10;
/// Jobs accepted but not yet picked up by a worker.
const QUEUE_DEPTH: usize = 64;
/// How long `shutdown` waits for each worker to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

struct PoolTask {
    job: CaptureJob,
    data: JobData,
}

pub struct CapturePool {
    tx: mpsc::Sender<PoolTask>,
    cancellations: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CapturePool {
    /// Spawn `concurrency` workers (clamped to the process ceiling) and
    /// return the shared handle used to submit and cancel jobs.
    pub fn start(ctx: CaptureContext, concurrency: usize) -> Arc<Self> {
        let concurrency = concurrency.clamp(1, MAX_CONCURRENT_JOBS);
        let (tx, rx) = mpsc::channel::<PoolTask>(QUEUE_DEPTH);
        let rx = Arc::new(Mutex::new(rx));

        let pool = Arc::new(Self {
            tx,
            cancellations: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        });

        for index in 0..concurrency {
            let worker_id = format!("capture-w{index}");
            let rx = Arc::clone(&rx);
            let cancellations = Arc::clone(&pool.cancellations);
            let shutdown = pool.shutdown.clone();
            let ctx = ctx.clone();

            let handle = tokio::spawn(async move {
                loop {
                    let task = {
                        let mut guard = rx.lock().await;
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                tracing::info!(target: "router::pool", worker = %worker_id, "worker shutting down");
                                break;
                            }
                            task = guard.recv() => match task {
                                Some(task) => task,
                                None => break,
                            }
                        }
                    };

                    let cancel = {
                        let guard = cancellations.lock().await;
                        guard.get(&task.job.id).cloned().unwrap_or_default()
                    };

                    tracing::debug!(
                        target: "router::pool",
                        worker = %worker_id,
                        job = %task.job.id,
                        "job picked up"
                    );

                    let worker = CaptureWorker::new(ctx.clone());
                    if let Err(err) = worker.run(&task.job, &task.data, cancel).await {
                        tracing::warn!(
                            target: "router::pool",
                            worker = %worker_id,
                            job = %task.job.id,
                            error = %err,
                            "job finished with error"
                        );
                    }

                    cancellations.lock().await.remove(&task.job.id);
                }
            });

            // Registration is synchronous with construction; no worker has
            // started consuming yet.
            pool.workers
                .try_lock()
                .expect("pool handles uncontended at startup")
                .push(handle);
        }

        pool
    }

    /// Hand a job to the pool. Refuses when the queue is full or the pool
    /// is shutting down; the router owns the retry.
    pub async fn submit(&self, job: CaptureJob, data: JobData) -> Result<()> {
        let job_id = job.id;
        {
            let mut guard = self.cancellations.lock().await;
            guard.insert(job_id, CancellationToken::new());
        }

        if let Err(err) = self.tx.try_send(PoolTask { job, data }) {
            self.cancellations.lock().await.remove(&job_id);
            return Err(CaptureError::BackendUnavailable(match err {
                mpsc::error::TrySendError::Full(_) => "worker pool queue is full".to_string(),
                mpsc::error::TrySendError::Closed(_) => "worker pool is stopped".to_string(),
            }));
        }
        Ok(())
    }

    /// Cancel a queued or running job. The owning worker finishes its
    /// current item before honouring this.
    pub async fn cancel(&self, job_id: JobId) -> Result<()> {
        let guard = self.cancellations.lock().await;
        match guard.get(&job_id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(CaptureError::NotFound(format!("job {job_id} not in pool"))),
        }
    }

    pub async fn shutdown(&self) {
        tracing::info!(target: "router::pool", "shutting down capture pool");
        self.shutdown.cancel();

        let handles = {
            let mut guard = self.workers.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(target: "router::pool", error = %err, "worker task failed")
                }
                Err(_) => {
                    tracing::warn!(target: "router::pool", "worker timed out during shutdown")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    use capstan_model::{BackendKind, JobKind, JobStatus, TriggerSource};

    use crate::store::ports::JobStore;
    use crate::testing::{
        InMemoryContentStore, InMemoryJobStore, InMemoryProgressStore, ScriptedForge, repo_ref,
    };

    async fn pool_fixture(concurrency: usize) -> (Arc<CapturePool>, Arc<InMemoryJobStore>, Uuid) {
        let jobs = Arc::new(InMemoryJobStore::default());
        let repo_id = Uuid::new_v4();
        jobs.add_repository(repo_ref(repo_id)).await;

        let ctx = CaptureContext {
            forge: Arc::new(ScriptedForge::default()) as _,
            jobs: Arc::clone(&jobs) as _,
            progress: Arc::new(InMemoryProgressStore::default()) as _,
            content: Arc::new(InMemoryContentStore::default()) as _,
        };
        (CapturePool::start(ctx, concurrency), jobs, repo_id)
    }

    fn job_for(repo_id: Uuid, number: i32) -> (CaptureJob, JobData) {
        let mut data = JobData::new(repo_id, "acme/widgets");
        data.pr_numbers = vec![number];
        data.trigger = TriggerSource::Manual;
        let job = CaptureJob::new(JobKind::Details, BackendKind::LowLatency, &data);
        (job, data)
    }

    #[tokio::test]
    async fn submitted_jobs_run_to_completion() {
        let (pool, jobs, repo_id) = pool_fixture(4).await;

        let mut ids = Vec::new();
        for number in 1..=6 {
            let (job, data) = job_for(repo_id, number);
            jobs.insert_job(&job).await.unwrap();
            ids.push(job.id);
            pool.submit(job, data).await.unwrap();
        }

        for id in &ids {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            loop {
                if let Some(job) = jobs.job(*id).await
                    && job.status == JobStatus::Completed
                {
                    break;
                }
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "job {id} never completed"
                );
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_refused() {
        let (pool, jobs, repo_id) = pool_fixture(1).await;
        pool.shutdown().await;

        let (job, data) = job_for(repo_id, 1);
        jobs.insert_job(&job).await.unwrap();
        // The channel itself stays open until the pool drops, but every
        // worker is gone; a full queue eventually refuses.
        for number in 0..(QUEUE_DEPTH as i32 + 2) {
            let (job, data) = job_for(repo_id, number);
            if pool.submit(job, data).await.is_err() {
                return;
            }
        }
        let _ = (job, data);
        panic!("pool kept accepting after shutdown");
    }

    #[tokio::test]
    async fn cancel_unknown_job_reports_not_found() {
        let (pool, _, _) = pool_fixture(1).await;
        let err = pool.cancel(JobId::new()).await.unwrap_err();
        assert!(matches!(err, CaptureError::NotFound(_)));
        pool.shutdown().await;
    }
}
