//! Per-source call spacing and throttling backoff

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::config::{DataServiceConfig, RetryConfig};
use crate::core::source::SourceId;

/// Exponential backoff with uniform jitter, capped in size and count.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    pub jitter: Duration,
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(20));
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(fastrand::u64(0..=jitter_ms))
        };
        self.base
            .saturating_mul(factor)
            .saturating_add(jitter)
            .min(self.max_delay)
    }
}

impl From<&RetryConfig> for BackoffPolicy {
    fn from(config: &RetryConfig) -> Self {
        BackoffPolicy {
            base: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_retries: config.max_retries,
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::from(&RetryConfig::default())
    }
}

#[derive(Debug, Default)]
struct SourceState {
    last_call: Option<Instant>,
    not_before: Option<Instant>,
    penalties: u32,
}

/// Diagnostic view of one source's limiter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceSnapshot {
    pub penalties: u32,
    /// Earliest instant the next call may start, if that is in the future.
    pub next_permitted: Option<Instant>,
}

/// Shared limiter for every source.
///
/// Each source has its own lock, so a source that is waiting out a backoff
/// never delays calls to another one.
pub struct RateLimiter {
    policy: BackoffPolicy,
    spacing: HashMap<SourceId, Duration>,
    states: Mutex<HashMap<SourceId, Arc<tokio::sync::Mutex<SourceState>>>>,
}

impl RateLimiter {
    pub fn new(policy: BackoffPolicy) -> Self {
        RateLimiter {
            policy,
            spacing: HashMap::new(),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Limiter with the retry policy and per-source spacing from `config`.
    pub fn from_config(config: &DataServiceConfig) -> Self {
        let mut limiter = RateLimiter::new(BackoffPolicy::from(&config.retry));
        for id in SourceId::NETWORK {
            if let Some(settings) = config.sources.get(id) {
                limiter = limiter.with_min_interval(id, settings.min_interval());
            }
        }
        limiter
    }

    pub fn with_min_interval(mut self, source: SourceId, interval: Duration) -> Self {
        self.spacing.insert(source, interval);
        self
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn max_retries(&self) -> u32 {
        self.policy.max_retries
    }

    pub fn min_interval(&self, source: SourceId) -> Duration {
        self.spacing.get(&source).copied().unwrap_or(Duration::ZERO)
    }

    fn state(&self, source: SourceId) -> Arc<tokio::sync::Mutex<SourceState>> {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.entry(source).or_default().clone()
    }

    /// Waits until a call to `source` is permitted, then records it.
    pub async fn acquire(&self, source: SourceId) {
        let state = self.state(source);
        let mut state = state.lock().await;

        let spacing_ready = state.last_call.map(|last| last + self.min_interval(source));
        let ready = match (spacing_ready, state.not_before) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        if let Some(ready) = ready {
            if ready > Instant::now() {
                let wait_ms = (ready - Instant::now()).as_millis() as u64;
                debug!(%source, wait_ms, "Waiting for rate limit");
                tokio::time::sleep_until(ready).await;
            }
        }
        state.last_call = Some(Instant::now());
    }

    /// Applies the next backoff step to `source` and returns the delay imposed.
    ///
    /// A server-provided hint is honoured when it exceeds the computed delay,
    /// but never beyond the policy's cap.
    pub async fn penalize(&self, source: SourceId, retry_after: Option<Duration>) -> Duration {
        let state = self.state(source);
        let mut state = state.lock().await;

        let computed = self.policy.delay_for(state.penalties);
        let delay = retry_after
            .map_or(computed, |hint| computed.max(hint))
            .min(self.policy.max_delay);
        state.penalties = state.penalties.saturating_add(1);

        let until = Instant::now() + delay;
        state.not_before = Some(state.not_before.map_or(until, |current| current.max(until)));
        warn!(
            %source,
            penalties = state.penalties,
            delay_ms = delay.as_millis() as u64,
            "Backing off"
        );
        delay
    }

    pub async fn record_success(&self, source: SourceId) {
        let state = self.state(source);
        let mut state = state.lock().await;
        if state.penalties > 0 {
            debug!(%source, "Backoff reset");
        }
        state.penalties = 0;
    }

    pub async fn snapshot(&self, source: SourceId) -> SourceSnapshot {
        let state = self.state(source);
        let state = state.lock().await;
        let now = Instant::now();
        let spacing_ready = state.last_call.map(|last| last + self.min_interval(source));
        let next_permitted = [spacing_ready, state.not_before]
            .into_iter()
            .flatten()
            .filter(|instant| *instant > now)
            .max();
        SourceSnapshot {
            penalties: state.penalties,
            next_permitted,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        RateLimiter::new(BackoffPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter_ms: u64) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            max_retries: 5,
            jitter: Duration::from_millis(jitter_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_enforces_spacing() {
        let limiter = RateLimiter::new(policy(0))
            .with_min_interval(SourceId::Primary, Duration::from_millis(200));
        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire(SourceId::Primary).await;
        }
        assert!(start.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_and_caps() {
        let limiter = RateLimiter::new(policy(0));
        let mut delays = Vec::new();
        for _ in 0..5 {
            delays.push(limiter.penalize(SourceId::Secondary, None).await);
        }
        let millis: Vec<u128> = delays.iter().map(Duration::as_millis).collect();
        assert_eq!(millis, vec![100, 200, 400, 500, 500]);
        assert_eq!(limiter.snapshot(SourceId::Secondary).await.penalties, 5);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = policy(50);
        for attempt in 0..3 {
            let delay = policy.delay_for(attempt);
            let floor = Duration::from_millis(100 * 2u64.pow(attempt));
            assert!(delay >= floor.min(policy.max_delay));
            assert!(delay <= (floor + Duration::from_millis(50)).min(policy.max_delay));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_is_honoured_up_to_cap() {
        let limiter = RateLimiter::new(policy(0));
        let delay = limiter
            .penalize(SourceId::Tertiary, Some(Duration::from_millis(300)))
            .await;
        assert_eq!(delay, Duration::from_millis(300));
        let delay = limiter
            .penalize(SourceId::Tertiary, Some(Duration::from_secs(60)))
            .await;
        assert_eq!(delay, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_penalty_delays_next_acquire() {
        let limiter = RateLimiter::new(policy(0));
        limiter.penalize(SourceId::Primary, None).await;
        let start = Instant::now();
        limiter.acquire(SourceId::Primary).await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sources_are_independent() {
        let limiter = RateLimiter::new(policy(0))
            .with_min_interval(SourceId::Primary, Duration::from_secs(5));
        limiter.acquire(SourceId::Primary).await;
        limiter.penalize(SourceId::Primary, Some(Duration::from_millis(500))).await;

        let start = Instant::now();
        limiter.acquire(SourceId::Secondary).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        let snapshot = limiter.snapshot(SourceId::Primary).await;
        assert_eq!(snapshot.penalties, 1);
        assert!(snapshot.next_permitted.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_backoff() {
        let limiter = RateLimiter::new(policy(0));
        limiter.penalize(SourceId::Primary, None).await;
        limiter.penalize(SourceId::Primary, None).await;
        limiter.record_success(SourceId::Primary).await;
        let delay = limiter.penalize(SourceId::Primary, None).await;
        assert_eq!(delay, Duration::from_millis(100));
    }

    #[test]
    fn test_from_config_uses_source_spacing() {
        let mut config = DataServiceConfig::default();
        config.sources.primary.min_interval_ms = 250;
        config.retry.max_retries = 2;
        let limiter = RateLimiter::from_config(&config);
        assert_eq!(limiter.min_interval(SourceId::Primary), Duration::from_millis(250));
        assert_eq!(limiter.min_interval(SourceId::Synthetic), Duration::ZERO);
        assert_eq!(limiter.max_retries(), 2);
    }
}
