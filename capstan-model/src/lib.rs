//! # Capstan Model
//!
//! Domain types shared across the Capstan workspace: capture jobs and their
//! progress rows, rollout configuration and its append-only history, the
//! normalised pull-request record produced by the forge client, and the
//! rate-limit sample/threshold types consumed by the governor.
//!
//! This crate performs no I/O. Everything here is plain data with the
//! invariant-preserving constructors and transitions the rest of the
//! workspace relies on.

pub mod error;
pub mod forge;
pub mod job;
pub mod progress;
pub mod rate_limit;
pub mod rollout;

pub use error::{CaptureError, Result};
pub use forge::{
    Actor, CommentSet, PrComment, PrFile, PrReview, PrState, PullRequest, PullRequestData,
    RateLimitInfo,
};
pub use job::{
    BackendKind, CaptureJob, ClassificationReason, JobData, JobId, JobKind, JobStatus,
    TriggerSource,
};
pub use progress::{CaptureProgress, ProgressError};
pub use rate_limit::{GovernorThresholds, RateLimitSample};
pub use rollout::{
    DEFAULT_FEATURE, RepositoryCategory, RolloutAction, RolloutConfig, RolloutHistoryEntry,
    RolloutStrategy,
};
