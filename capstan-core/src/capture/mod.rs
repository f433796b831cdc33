//! Capture workers: turn forge reads into store upserts for one job,
//! item by item, with bounded retries per item and a progress row
//! maintained throughout.

pub mod progress;
pub mod worker;

use std::sync::Arc;

use crate::forge::ForgeReader;
use crate::store::ports::{ContentStore, JobStore, ProgressStore};

pub use progress::ProgressTracker;
pub use worker::CaptureWorker;

/// Everything a worker needs, wired explicitly at construction.
#[derive(Clone)]
pub struct CaptureContext {
    pub forge: Arc<dyn ForgeReader>,
    pub jobs: Arc<dyn JobStore>,
    pub progress: Arc<dyn ProgressStore>,
    pub content: Arc<dyn ContentStore>,
}
