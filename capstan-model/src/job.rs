use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CaptureError;

/// Unique identifier for capture jobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The unit of work a capture job performs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Details,
    Reviews,
    Comments,
    HistoricalSync,
    FileChanges,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Details => "details",
            JobKind::Reviews => "reviews",
            JobKind::Comments => "comments",
            JobKind::HistoricalSync => "historical-sync",
            JobKind::FileChanges => "file-changes",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "details" => Ok(JobKind::Details),
            "reviews" => Ok(JobKind::Reviews),
            "comments" => Ok(JobKind::Comments),
            "historical-sync" => Ok(JobKind::HistoricalSync),
            "file-changes" => Ok(JobKind::FileChanges),
            other => Err(CaptureError::InvalidArgument(format!(
                "unknown job kind: {other}"
            ))),
        }
    }
}

/// Which execution path a job was routed to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    LowLatency,
    Batch,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::LowLatency => "lowlatency",
            BackendKind::Batch => "batch",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lowlatency" => Ok(BackendKind::LowLatency),
            "batch" => Ok(BackendKind::Batch),
            other => Err(CaptureError::InvalidArgument(format!(
                "unknown backend: {other}"
            ))),
        }
    }
}

/// Job lifecycle. Transitions are monotonic:
/// `Pending -> Processing -> (Completed | Failed)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(CaptureError::InvalidArgument(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

/// Who asked for the capture.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Manual,
    Scheduled,
}

/// Caller-supplied description of the work to capture.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobData {
    pub repository_id: Uuid,
    pub repository_name: String,
    /// Explicit pull-request numbers; empty means "derive the item list".
    #[serde(default)]
    pub pr_numbers: Vec<i32>,
    pub time_range_days: Option<i64>,
    pub max_items: Option<usize>,
    pub trigger: TriggerSource,
}

impl JobData {
    pub fn new(repository_id: Uuid, repository_name: impl Into<String>) -> Self {
        Self {
            repository_id,
            repository_name: repository_name.into(),
            pr_numbers: Vec::new(),
            time_range_days: None,
            max_items: None,
            trigger: TriggerSource::Scheduled,
        }
    }
}

/// Why the classifier picked the back-end it picked. Conditions are
/// evaluated in this order; the first match wins.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationReason {
    RecentWindow,
    SmallPrSet,
    ManualTrigger,
    Historical,
}

/// Row in `progressive_capture_jobs`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaptureJob {
    pub id: JobId,
    pub kind: JobKind,
    pub repository_id: Uuid,
    pub repository_name: String,
    pub backend: BackendKind,
    pub status: JobStatus,
    pub external_run_id: Option<String>,
    pub time_range_days: Option<i64>,
    pub metadata: Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CaptureJob {
    pub fn new(kind: JobKind, backend: BackendKind, data: &JobData) -> Self {
        let metadata = serde_json::json!({
            "pr_numbers": data.pr_numbers,
            "max_items": data.max_items,
            "trigger": data.trigger,
        });
        Self {
            id: JobId::new(),
            kind,
            repository_id: data.repository_id,
            repository_name: data.repository_name.clone(),
            backend,
            status: JobStatus::Pending,
            external_run_id: None,
            time_range_days: data.time_range_days,
            metadata,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// `started_at` is non-null iff the job reached `Processing`.
    pub fn mark_processing(&mut self) {
        self.status = JobStatus::Processing;
        self.started_at.get_or_insert_with(Utc::now);
    }

    /// `completed_at` is non-null iff the job reached a terminal status.
    pub fn mark_completed(&mut self) {
        self.status = JobStatus::Completed;
        self.completed_at.get_or_insert_with(Utc::now);
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error = Some(reason.into());
        self.completed_at.get_or_insert_with(Utc::now);
    }
}
