use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::error::FetchError;
use crate::core::request::DataRequest;
use crate::core::series::FetchResult;
use crate::core::source::SeriesSource;
use crate::providers::limiter::RateLimiter;

const USER_AGENT: &str = "marketfeed/0.1";
const MAX_ERROR_BODY: usize = 200;

/// Bounds applied around a single source's attempts for one request.
#[derive(Debug, Clone, Copy)]
pub struct AttemptPolicy {
    pub timeout: Duration,
    /// Extra attempts allowed after a network failure.
    pub network_retries: u32,
    pub deadline: Option<Instant>,
}

/// Calls `source` under the limiter, a per-call timeout and the retry rules.
///
/// Throttling is retried up to the limiter's cap and network failures up to
/// `network_retries`, both after a backoff. Anything else, timeouts included,
/// is returned at once so the caller can move on.
pub async fn fetch_with_policy(
    source: &dyn SeriesSource,
    limiter: &RateLimiter,
    request: &DataRequest,
    policy: &AttemptPolicy,
) -> Result<FetchResult, FetchError> {
    let id = source.id();
    if !source.supports(request.interval()) {
        return Err(FetchError::Unsupported(request.interval()));
    }

    let mut throttled = 0;
    let mut network_failures = 0;
    loop {
        match policy.deadline {
            Some(deadline) => {
                if tokio::time::timeout_at(deadline, limiter.acquire(id))
                    .await
                    .is_err()
                {
                    return Err(FetchError::Cancelled);
                }
            }
            None => limiter.acquire(id).await,
        }

        let budget = match policy.deadline {
            Some(deadline) => policy
                .timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => policy.timeout,
        };
        if budget.is_zero() {
            return Err(FetchError::Cancelled);
        }

        let outcome = match tokio::time::timeout(budget, source.fetch_series(request)).await {
            Ok(outcome) => outcome,
            Err(_) if budget < policy.timeout => Err(FetchError::Cancelled),
            Err(_) => Err(FetchError::Timeout(policy.timeout)),
        };

        match outcome {
            Ok(result) => {
                limiter.record_success(id).await;
                return Ok(result);
            }
            Err(FetchError::RateLimited {
                message,
                retry_after,
            }) => {
                if throttled >= limiter.max_retries() {
                    warn!(
                        source = %id,
                        attempts = throttled + 1,
                        "Giving up after repeated throttling"
                    );
                    return Err(FetchError::RateLimited {
                        message,
                        retry_after,
                    });
                }
                throttled += 1;
                debug!(source = %id, %message, "Throttled, retrying after backoff");
                limiter.penalize(id, retry_after).await;
            }
            Err(FetchError::Network(message)) => {
                if network_failures >= policy.network_retries {
                    return Err(FetchError::Network(message));
                }
                network_failures += 1;
                debug!(source = %id, %message, "Network failure, retrying after backoff");
                limiter.penalize(id, None).await;
            }
            Err(other) => return Err(other),
        }
    }
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Falling back to default HTTP client");
            reqwest::Client::new()
        })
}

/// Parses a `Retry-After` header given in seconds.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Maps a non-success status to the matching fetch error.
pub fn status_error(status: StatusCode, headers: &HeaderMap, body: &str) -> FetchError {
    let excerpt: String = body.chars().take(MAX_ERROR_BODY).collect();
    if status == StatusCode::TOO_MANY_REQUESTS {
        FetchError::rate_limited(format!("HTTP {status}"), retry_after(headers))
    } else if status.is_server_error() {
        FetchError::Network(format!("HTTP {status}: {excerpt}"))
    } else {
        FetchError::Upstream {
            status: status.as_u16(),
            message: excerpt,
        }
    }
}

/// GETs `url` and returns the body of a successful response.
pub async fn get_text(client: &reqwest::Client, url: &str) -> Result<String, FetchError> {
    debug!("Requesting {}", url);
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| FetchError::Network(format!("request to {url} failed: {e}")))?;

    let status = response.status();
    let headers = response.headers().clone();
    let body = response
        .text()
        .await
        .map_err(|e| FetchError::Network(format!("reading body from {url} failed: {e}")))?;

    if !status.is_success() {
        return Err(status_error(status, &headers, &body));
    }
    if body.trim().is_empty() {
        return Err(FetchError::Malformed("empty response body".to_string()));
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::request::{Interval, Period, Symbol};
    use crate::core::series::SeriesPoint;
    use crate::core::source::SourceId;
    use crate::providers::limiter::BackoffPolicy;
    use async_trait::async_trait;
    use chrono::Utc;
    use reqwest::header::HeaderValue;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays a fixed list of outcomes, then succeeds.
    struct Scripted {
        outcomes: Mutex<Vec<FetchError>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl Scripted {
        fn new(mut outcomes: Vec<FetchError>) -> Self {
            outcomes.reverse();
            Scripted {
                outcomes: Mutex::new(outcomes),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SeriesSource for Scripted {
        fn id(&self) -> SourceId {
            SourceId::Primary
        }

        fn supports(&self, interval: Interval) -> bool {
            interval != Interval::OneMinute
        }

        async fn fetch_series(&self, _request: &DataRequest) -> Result<FetchResult, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let next = self.outcomes.lock().unwrap().pop();
            if let Some(err) = next {
                return Err(err);
            }
            let point = SeriesPoint::new(Utc::now(), 1.0, 1.0, 1.0, 1.0, 0);
            Ok(FetchResult::new(vec![point], SourceId::Primary, Utc::now()))
        }
    }

    fn limiter() -> RateLimiter {
        RateLimiter::new(BackoffPolicy {
            base: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_retries: 2,
            jitter: Duration::ZERO,
        })
    }

    fn request(interval: Interval) -> DataRequest {
        DataRequest::new(
            Symbol::parse("ABC").unwrap(),
            Period::FiveDays,
            interval,
            Utc::now(),
        )
        .unwrap()
    }

    fn policy() -> AttemptPolicy {
        AttemptPolicy {
            timeout: Duration::from_secs(10),
            network_retries: 1,
            deadline: None,
        }
    }

    async fn daily(source: &Scripted) -> Result<FetchResult, FetchError> {
        fetch_with_policy(source, &limiter(), &request(Interval::Daily), &policy()).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limits_are_retried_up_to_cap() {
        let source = Scripted::new(vec![
            FetchError::rate_limited("slow", None),
            FetchError::rate_limited("slow", None),
        ]);
        let result = daily(&source).await;
        assert!(result.is_ok());
        assert_eq!(source.calls(), 3);

        let source = Scripted::new(vec![FetchError::rate_limited("slow", None); 3]);
        let result = daily(&source).await;
        assert!(matches!(result, Err(FetchError::RateLimited { .. })));
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_errors_retry_once() {
        let source = Scripted::new(vec![FetchError::Network("reset".into())]);
        assert!(daily(&source).await.is_ok());

        let source = Scripted::new(vec![FetchError::Network("reset".into()); 2]);
        let result = daily(&source).await;
        assert_eq!(result, Err(FetchError::Network("reset".into())));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_errors_return_immediately() {
        let source = Scripted::new(vec![FetchError::Malformed("garbage".into())]);
        let result = daily(&source).await;
        assert_eq!(result, Err(FetchError::Malformed("garbage".into())));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_not_retried() {
        let mut source = Scripted::new(vec![]);
        source.delay = Duration::from_secs(30);
        let result = daily(&source).await;
        assert_eq!(result, Err(FetchError::Timeout(Duration::from_secs(10))));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_call() {
        let mut source = Scripted::new(vec![]);
        source.delay = Duration::from_secs(30);
        let policy = AttemptPolicy {
            deadline: Some(Instant::now() + Duration::from_secs(2)),
            ..policy()
        };
        let result =
            fetch_with_policy(&source, &limiter(), &request(Interval::Daily), &policy).await;
        assert_eq!(result, Err(FetchError::Cancelled));
    }

    #[tokio::test]
    async fn test_unsupported_interval_skips_call() {
        let source = Scripted::new(vec![]);
        let result =
            fetch_with_policy(&source, &limiter(), &request(Interval::OneMinute), &policy()).await;
        assert_eq!(result, Err(FetchError::Unsupported(Interval::OneMinute)));
        assert_eq!(source.calls(), 0);
    }

    #[test]
    fn test_status_classification() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(
            status_error(StatusCode::TOO_MANY_REQUESTS, &headers, ""),
            FetchError::rate_limited("HTTP 429 Too Many Requests", Some(Duration::from_secs(7)))
        );
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, &HeaderMap::new(), "oops"),
            FetchError::Network(_)
        ));
        assert_eq!(
            status_error(StatusCode::NOT_FOUND, &HeaderMap::new(), "missing"),
            FetchError::Upstream {
                status: 404,
                message: "missing".into()
            }
        );
    }
}
