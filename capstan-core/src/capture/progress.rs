use std::sync::Arc;

use tokio::sync::Mutex;

use capstan_model::{CaptureProgress, JobId, Result};

use crate::store::ports::ProgressStore;

/// Owns the in-memory progress row for one running job and flushes it to
/// the store after every change.
pub struct ProgressTracker {
    store: Arc<dyn ProgressStore>,
    progress: Mutex<CaptureProgress>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn ProgressStore>, job_id: JobId, total: u32) -> Self {
        Self {
            store,
            progress: Mutex::new(CaptureProgress::new(job_id, total)),
        }
    }

    pub async fn begin(&self) -> Result<()> {
        let progress = self.progress.lock().await;
        self.store.upsert(&progress).await
    }

    pub async fn item_started(&self, item: impl Into<String>) -> Result<()> {
        let mut progress = self.progress.lock().await;
        progress.set_current_item(item);
        self.store.upsert(&progress).await
    }

    pub async fn success(&self) -> Result<()> {
        let mut progress = self.progress.lock().await;
        progress.record_success();
        self.store.upsert(&progress).await
    }

    pub async fn failure(
        &self,
        item: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<()> {
        let mut progress = self.progress.lock().await;
        progress.record_failure(item, message);
        self.store.upsert(&progress).await
    }

    pub async fn snapshot(&self) -> CaptureProgress {
        self.progress.lock().await.clone()
    }
}
