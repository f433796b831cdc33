//! Back-end classification. A pure function of the request — no store,
//! no forge — so production and tests share the exact same decision.

use capstan_model::{BackendKind, ClassificationReason, JobData, TriggerSource};

/// Largest explicit PR set that still counts as latency-sensitive.
pub const SMALL_PR_SET_MAX: usize = 10;
/// Time ranges at or under this many days are latency-sensitive.
pub const RECENT_WINDOW_DAYS: i64 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Classification {
    pub backend: BackendKind,
    pub reason: ClassificationReason,
}

/// Conditions are checked in order; the first match wins. Anything that
/// matches none of them is historical bulk work for the batch runner.
pub fn classify(data: &JobData) -> Classification {
    if data
        .time_range_days
        .is_some_and(|days| days <= RECENT_WINDOW_DAYS)
    {
        return Classification {
            backend: BackendKind::LowLatency,
            reason: ClassificationReason::RecentWindow,
        };
    }

    if !data.pr_numbers.is_empty() && data.pr_numbers.len() <= SMALL_PR_SET_MAX {
        return Classification {
            backend: BackendKind::LowLatency,
            reason: ClassificationReason::SmallPrSet,
        };
    }

    if data.trigger == TriggerSource::Manual {
        return Classification {
            backend: BackendKind::LowLatency,
            reason: ClassificationReason::ManualTrigger,
        };
    }

    Classification {
        backend: BackendKind::Batch,
        reason: ClassificationReason::Historical,
    }
}
