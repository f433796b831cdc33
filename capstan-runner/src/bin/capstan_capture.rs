//! Per-invocation capture runner: the entry point the batch workflow
//! executes. Reads its parameters from the environment, runs one job to
//! completion and enforces the hard run ceiling.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use capstan_config::{CaptureParams, Config};
use capstan_core::capture::{CaptureContext, CaptureWorker};
use capstan_core::forge::HybridForgeClient;
use capstan_core::governor::RateLimitGovernor;
use capstan_core::store::{
    self, PostgresContentStore, PostgresJobStore, PostgresProgressStore, ensure_schema,
    ports::JobStore,
};
use capstan_model::{BackendKind, CaptureJob, JobData, JobKind, TriggerSource};

/// Batch runs are failed with reason `timeout` past this ceiling.
const RUN_CEILING: Duration = Duration::from_secs(120 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let kind = match env::args().nth(1) {
        Some(raw) => raw
            .parse::<JobKind>()
            .with_context(|| format!("unknown job kind argument: {raw}"))?,
        None => JobKind::HistoricalSync,
    };

    let config = Config::from_env()?;
    let params = CaptureParams::from_env()?;

    let pool = store::connect(&config.store.database_url).await?;
    ensure_schema(&pool).await?;

    let governor = Arc::new(RateLimitGovernor::default());
    let forge = Arc::new(HybridForgeClient::connect(
        &config.forge.api_base,
        &config.forge.graphql_url,
        &config.forge.token,
        Arc::clone(&governor),
        config.use_compound_queries,
    )?);

    let jobs = Arc::new(PostgresJobStore::new(pool.clone()));
    let ctx = CaptureContext {
        forge,
        jobs: Arc::clone(&jobs) as Arc<dyn JobStore>,
        progress: Arc::new(PostgresProgressStore::new(pool.clone())),
        content: Arc::new(PostgresContentStore::new(pool)),
    };

    let data = JobData {
        repository_id: params.repository_id,
        repository_name: params.repository_name.clone(),
        pr_numbers: params.pr_numbers.clone(),
        time_range_days: params.time_range_days,
        max_items: params.max_items,
        trigger: TriggerSource::Scheduled,
    };

    // The router usually created the row before dispatching; direct
    // invocations create their own.
    let job = match params.job_id {
        Some(job_id) => jobs
            .fetch_job(job_id)
            .await?
            .with_context(|| format!("job {job_id} not found"))?,
        None => {
            let job = CaptureJob::new(kind, BackendKind::Batch, &data);
            jobs.insert_job(&job).await?;
            job
        }
    };

    tracing::info!(
        job = %job.id,
        kind = %job.kind,
        repository = %params.repository_name,
        "capture run starting"
    );

    let worker = CaptureWorker::new(ctx);
    match tokio::time::timeout(RUN_CEILING, worker.run(&job, &data, CancellationToken::new()))
        .await
    {
        Ok(result) => {
            result?;
            let report = governor.generate_report();
            tracing::info!(
                remaining = report.summary.current_remaining,
                total_cost = report.summary.total_cost,
                "capture run finished"
            );
            Ok(())
        }
        Err(_) => {
            jobs.mark_failed(job.id, "timeout").await?;
            anyhow::bail!("capture run exceeded the {}m ceiling", RUN_CEILING.as_secs() / 60)
        }
    }
}
