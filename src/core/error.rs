//! Error taxonomy for the retrieval layer

use std::time::Duration;

use thiserror::Error;

use crate::core::request::Interval;
use crate::core::validate::Violation;

/// The only error that crosses the `DataService` boundary.
///
/// Everything else (provider outages, throttling, garbled payloads) is absorbed
/// by the fallback chain and surfaces as a degraded result instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataError {
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl DataError {
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        DataError::InvalidRequest {
            reason: reason.into(),
        }
    }
}

/// Failure of a single source attempt.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("upstream returned status {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("interval {0} is not supported by this source")]
    Unsupported(Interval),
    #[error("validation failed: {}", join_violations(.0))]
    Validation(Vec<Violation>),
    #[error("deadline exceeded")]
    Cancelled,
    #[error("all sources exhausted")]
    AllSourcesExhausted,
}

impl FetchError {
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        FetchError::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    /// Whether another attempt against the same source could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Network(_) | FetchError::RateLimited { .. })
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(FetchError::Network("reset".to_string()).is_retryable());
        assert!(FetchError::rate_limited("slow down", None).is_retryable());
        assert!(!FetchError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!FetchError::Malformed("bad".to_string()).is_retryable());
        assert!(!FetchError::Validation(vec![Violation::Empty]).is_retryable());
    }

    #[test]
    fn test_validation_message_lists_violations() {
        let err = FetchError::Validation(vec![
            Violation::Empty,
            Violation::HighBelowLow { index: 3 },
        ]);
        assert_eq!(
            err.to_string(),
            "validation failed: series is empty; point 3: high is below low"
        );
    }
}
