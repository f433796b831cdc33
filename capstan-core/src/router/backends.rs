use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use capstan_model::{BackendKind, CaptureError, CaptureJob, JobData, JobId, JobKind, Result};

use super::pool::CapturePool;

/// What a back-end hands back on acceptance. Only the batch runner has an
/// external identity to report.
#[derive(Clone, Debug, Default)]
pub struct BackendReceipt {
    pub external_run_id: Option<String>,
}

/// The capability set both back-ends implement.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    fn kind(&self) -> BackendKind;
    /// Accept dispatch of a pending job. Returns once the work is queued
    /// or handed to the external runner, never after it completes.
    async fn accept(&self, job: &CaptureJob, data: &JobData) -> Result<BackendReceipt>;
    async fn cancel(&self, job_id: JobId) -> Result<()>;
}

pub struct LowLatencyBackend {
    pool: Arc<CapturePool>,
}

impl LowLatencyBackend {
    pub fn new(pool: Arc<CapturePool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CaptureBackend for LowLatencyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LowLatency
    }

    async fn accept(&self, job: &CaptureJob, data: &JobData) -> Result<BackendReceipt> {
        self.pool.submit(job.clone(), data.clone()).await?;
        Ok(BackendReceipt::default())
    }

    async fn cancel(&self, job_id: JobId) -> Result<()> {
        self.pool.cancel(job_id).await
    }
}

/// External job-runner dispatch: fire a named workflow with a flat string
/// map and get an opaque run id back. Never blocks on run completion.
#[async_trait]
pub trait WorkflowDispatcher: Send + Sync {
    async fn dispatch(&self, workflow: &str, inputs: &HashMap<String, String>) -> Result<String>;
}

pub struct HttpWorkflowDispatcher {
    client: Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct DispatchResponse {
    run_id: String,
}

impl HttpWorkflowDispatcher {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| CaptureError::Config(format!("dispatcher client build failed: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token: token.into(),
        })
    }
}

#[async_trait]
impl WorkflowDispatcher for HttpWorkflowDispatcher {
    async fn dispatch(&self, workflow: &str, inputs: &HashMap<String, String>) -> Result<String> {
        let url = format!("{}/workflows/{workflow}/dispatch", self.base_url);
        tracing::info!(target: "router::batch", workflow, "dispatching batch workflow");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(inputs)
            .send()
            .await
            .map_err(crate::forge::transport)?;

        if !response.status().is_success() {
            return Err(CaptureError::BackendUnavailable(format!(
                "job runner returned status {}",
                response.status()
            )));
        }

        let body: DispatchResponse = response.json().await.map_err(crate::forge::transport)?;
        Ok(body.run_id)
    }
}

pub struct BatchBackend {
    dispatcher: Arc<dyn WorkflowDispatcher>,
}

impl BatchBackend {
    pub fn new(dispatcher: Arc<dyn WorkflowDispatcher>) -> Self {
        Self { dispatcher }
    }

    fn workflow_for(kind: JobKind) -> &'static str {
        match kind {
            JobKind::Details => "capture-details",
            JobKind::Reviews => "capture-reviews",
            JobKind::Comments => "capture-comments",
            JobKind::HistoricalSync => "historical-sync",
            JobKind::FileChanges => "capture-file-changes",
        }
    }

    fn inputs_for(job: &CaptureJob, data: &JobData) -> HashMap<String, String> {
        let mut inputs = HashMap::new();
        inputs.insert("repository_id".to_string(), data.repository_id.to_string());
        inputs.insert(
            "repository_name".to_string(),
            data.repository_name.clone(),
        );
        inputs.insert("job_id".to_string(), job.id.to_string());
        if !data.pr_numbers.is_empty() {
            inputs.insert(
                "pr_numbers".to_string(),
                data.pr_numbers
                    .iter()
                    .map(|n| n.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        if let Some(days) = data.time_range_days {
            inputs.insert("time_range".to_string(), days.to_string());
        }
        if let Some(max_items) = data.max_items {
            inputs.insert("max_items".to_string(), max_items.to_string());
        }
        inputs
    }
}

#[async_trait]
impl CaptureBackend for BatchBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Batch
    }

    async fn accept(&self, job: &CaptureJob, data: &JobData) -> Result<BackendReceipt> {
        let workflow = Self::workflow_for(job.kind);
        let inputs = Self::inputs_for(job, data);
        let run_id = self.dispatcher.dispatch(workflow, &inputs).await?;
        Ok(BackendReceipt {
            external_run_id: Some(run_id),
        })
    }

    async fn cancel(&self, _job_id: JobId) -> Result<()> {
        // Batch runs live in the external runner; it owns their
        // cancellation and the 120-minute ceiling.
        Err(CaptureError::InvalidArgument(
            "batch runs are cancelled by the external job runner".to_string(),
        ))
    }
}
