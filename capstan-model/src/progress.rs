use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// How many recent per-item errors a progress row keeps.
pub const RECENT_ERROR_CAP: usize = 10;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressError {
    pub item: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Row in `progressive_capture_progress`, one per job.
///
/// Counts are monotonically non-decreasing and `processed + failed <= total`
/// once `total` is known; the only mutators are the increment methods below.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaptureProgress {
    pub job_id: JobId,
    pub total: u32,
    pub processed: u32,
    pub failed: u32,
    pub current_item: Option<String>,
    pub recent_errors: Vec<ProgressError>,
    pub updated_at: DateTime<Utc>,
}

impl CaptureProgress {
    pub fn new(job_id: JobId, total: u32) -> Self {
        Self {
            job_id,
            total,
            processed: 0,
            failed: 0,
            current_item: None,
            recent_errors: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn set_current_item(&mut self, item: impl Into<String>) {
        self.current_item = Some(item.into());
        self.updated_at = Utc::now();
    }

    pub fn record_success(&mut self) {
        if self.processed + self.failed < self.total {
            self.processed += 1;
        }
        self.updated_at = Utc::now();
    }

    pub fn record_failure(&mut self, item: impl Into<String>, message: impl Into<String>) {
        if self.processed + self.failed < self.total {
            self.failed += 1;
        }
        self.recent_errors.push(ProgressError {
            item: item.into(),
            message: message.into(),
            occurred_at: Utc::now(),
        });
        if self.recent_errors.len() > RECENT_ERROR_CAP {
            let excess = self.recent_errors.len() - RECENT_ERROR_CAP;
            self.recent_errors.drain(..excess);
        }
        self.updated_at = Utc::now();
    }

    pub fn remaining(&self) -> u32 {
        self.total.saturating_sub(self.processed + self.failed)
    }
}
