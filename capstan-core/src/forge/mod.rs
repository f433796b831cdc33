//! Hybrid forge client.
//!
//! One logical read is served either by a single compound query against the
//! forge's structured-query endpoint or assembled from up to five
//! fine-grained REST calls. [`hybrid::HybridForgeClient`] composes both
//! behind the [`traits::ForgeReader`] capability and owns the fallback
//! policy and the per-path metrics.

pub mod compound;
pub mod hybrid;
pub mod metrics;
pub mod rest;
pub mod traits;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;

use capstan_model::CaptureError;

pub use hybrid::HybridForgeClient;
pub use metrics::{ForgeMetrics, QueryMetrics};
pub use traits::{CompoundReader, ForgeReader};

pub(crate) fn transport(err: reqwest::Error) -> CaptureError {
    if err.is_timeout() {
        CaptureError::Timeout(err.to_string())
    } else {
        CaptureError::Transport(err.to_string())
    }
}

/// Budget counters the forge attaches to REST responses.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct BudgetHeaders {
    pub remaining: i64,
    pub limit: i64,
    pub reset_at: Option<DateTime<Utc>>,
}

pub(crate) fn parse_budget_headers(headers: &HeaderMap) -> Option<BudgetHeaders> {
    let header_i64 = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
    };
    let remaining = header_i64("x-ratelimit-remaining")?;
    let limit = header_i64("x-ratelimit-limit")?;
    let reset_at = header_i64("x-ratelimit-reset")
        .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single());
    Some(BudgetHeaders {
        remaining,
        limit,
        reset_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};

    #[test]
    fn budget_headers_parse_when_present() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-ratelimit-remaining"),
            HeaderValue::from_static("4321"),
        );
        headers.insert(
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderValue::from_static("5000"),
        );
        headers.insert(
            HeaderName::from_static("x-ratelimit-reset"),
            HeaderValue::from_static("1700000000"),
        );
        let budget = parse_budget_headers(&headers).unwrap();
        assert_eq!(budget.remaining, 4321);
        assert_eq!(budget.limit, 5000);
        assert!(budget.reset_at.is_some());
    }

    #[test]
    fn budget_headers_absent_yields_none() {
        assert!(parse_budget_headers(&HeaderMap::new()).is_none());
    }
}
