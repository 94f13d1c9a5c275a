//! The orchestrator: cache, then sources in priority order, then synthetic data

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::core::cache::cache_key;
use crate::core::config::{DataServiceConfig, TtlConfig};
use crate::core::error::{DataError, FetchError};
use crate::core::quality::{QualityScore, QualityScorer};
use crate::core::request::{DataRequest, Interval, Period, RequestClass, Symbol};
use crate::core::series::{FetchResult, SeriesPoint};
use crate::core::source::{SeriesSource, SourceId};
use crate::core::validate::Validator;
use crate::providers::limiter::RateLimiter;
use crate::providers::synthetic::SyntheticGenerator;
use crate::providers::util::{AttemptPolicy, fetch_with_policy};
use crate::providers::source_for;
use crate::store::CacheStore;

type InFlight = Shared<BoxFuture<'static, Option<Arc<FetchResult>>>>;

/// A series together with its trust signals.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesResponse {
    pub series: Arc<FetchResult>,
    pub quality: QualityScore,
    /// Served from cache rather than fetched for this call.
    pub cached: bool,
}

impl SeriesResponse {
    pub fn points(&self) -> &[SeriesPoint] {
        &self.series.points
    }

    pub fn source_id(&self) -> SourceId {
        self.series.source_id
    }

    pub fn degraded(&self) -> bool {
        self.series.degraded
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuoteResponse {
    pub symbol: Symbol,
    pub point: SeriesPoint,
    pub source_id: SourceId,
    pub degraded: bool,
    pub quality: QualityScore,
}

struct SourceSlot {
    source: Arc<dyn SeriesSource>,
    timeout: Duration,
}

struct ServiceInner {
    cache: Arc<CacheStore>,
    limiter: Arc<RateLimiter>,
    sources: Vec<SourceSlot>,
    scorer: QualityScorer,
    synthetic: SyntheticGenerator,
    ttl: TtlConfig,
    bucket: chrono::Duration,
    network_retries: u32,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

impl ServiceInner {
    /// Walks the sources in order; the first validated result is cached and returned.
    async fn fetch_from_sources(
        &self,
        key: &str,
        request: &DataRequest,
        class: RequestClass,
        deadline: Option<Instant>,
    ) -> Option<Arc<FetchResult>> {
        let validator = Validator::new(request.interval());

        for slot in &self.sources {
            let id = slot.source.id();
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(source = %id, "Deadline passed, skipping remaining sources");
                break;
            }

            let policy = AttemptPolicy {
                timeout: slot.timeout,
                network_retries: self.network_retries,
                deadline,
            };
            let outcome = fetch_with_policy(slot.source.as_ref(), &self.limiter, request, &policy)
                .await
                .and_then(|result| validator.check(&result).map(|()| result));

            match outcome {
                Ok(result) => {
                    info!(source = %id, points = result.points.len(), "Fetched series");
                    let series = Arc::new(result);
                    self.cache
                        .put(key, Arc::clone(&series), self.ttl.for_class(class))
                        .await;
                    return Some(series);
                }
                Err(FetchError::Cancelled) => {
                    warn!(source = %id, "Deadline exceeded during fetch");
                    break;
                }
                Err(e) => warn!(source = %id, error = %e, "Source failed, trying next"),
            }
        }

        warn!(
            symbol = %request.symbol(),
            error = %FetchError::AllSourcesExhausted,
            "Falling back to synthetic data"
        );
        None
    }
}

/// Entry point for consumers. Cheap to clone; clones share cache, limiter and in-flight state.
#[derive(Clone)]
pub struct DataService {
    inner: Arc<ServiceInner>,
}

impl DataService {
    /// Builds a service over explicit sources, tried in the order given.
    pub fn new(
        config: &DataServiceConfig,
        cache: Arc<CacheStore>,
        sources: Vec<Arc<dyn SeriesSource>>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::from_config(config));
        Self::with_limiter(config, cache, sources, limiter)
    }

    /// Like [`new`](Self::new), but fetches through `limiter`, which the
    /// sources may also hold.
    pub fn with_limiter(
        config: &DataServiceConfig,
        cache: Arc<CacheStore>,
        sources: Vec<Arc<dyn SeriesSource>>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let sources = sources
            .into_iter()
            .map(|source| {
                let timeout = config
                    .sources
                    .get(source.id())
                    .map_or(Duration::from_secs(10), |s| s.timeout());
                SourceSlot { source, timeout }
            })
            .collect();

        DataService {
            inner: Arc::new(ServiceInner {
                cache,
                limiter,
                sources,
                scorer: QualityScorer::new(config.quality.clone()),
                synthetic: SyntheticGenerator::new(config.synthetic.clone()),
                ttl: config.cache.ttl.clone(),
                bucket: config.cache.bucket(),
                network_retries: config.retry.network_retries,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Builds the cache and the enabled adapters from configuration.
    pub fn from_config(config: &DataServiceConfig) -> Self {
        let cache = Arc::new(CacheStore::from_config(config));
        let limiter = Arc::new(RateLimiter::from_config(config));
        let sources = config
            .ordered_sources()
            .into_iter()
            .filter_map(|id| source_for(id, config, &limiter))
            .collect();
        Self::with_limiter(config, cache, sources, limiter)
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    pub async fn get_series(
        &self,
        symbol: &str,
        period: &str,
        interval: &str,
    ) -> Result<SeriesResponse, DataError> {
        let request = DataRequest::parse(symbol, period, interval)?;
        Ok(self.get_series_for(&request).await)
    }

    #[instrument(
        skip(self, request),
        fields(
            symbol = %request.symbol(),
            period = %request.period(),
            interval = %request.interval()
        )
    )]
    pub async fn get_series_for(&self, request: &DataRequest) -> SeriesResponse {
        self.resolve(request, request.class(), None).await
    }

    /// Like [`get_series_for`](Self::get_series_for), but gives up on the
    /// network at `deadline` and answers with synthetic data instead.
    #[instrument(skip(self, request), fields(symbol = %request.symbol()))]
    pub async fn get_series_with_deadline(
        &self,
        request: &DataRequest,
        deadline: Instant,
    ) -> SeriesResponse {
        self.resolve(request, request.class(), Some(deadline)).await
    }

    /// Latest bar for `symbol`, cached with the short quote TTL.
    pub async fn get_quote(&self, symbol: &str) -> Result<QuoteResponse, DataError> {
        let request = DataRequest::new(
            Symbol::parse(symbol)?,
            Period::FiveDays,
            Interval::Daily,
            Utc::now(),
        )?;
        let response = self.resolve(&request, RequestClass::Quote, None).await;
        let Some(point) = response.series.last_point().copied() else {
            warn!(symbol = %request.symbol(), "Empty quote series, using a synthetic bar");
            return Ok(self.synthetic_quote(&request));
        };

        Ok(QuoteResponse {
            symbol: request.symbol().clone(),
            point,
            source_id: response.source_id(),
            degraded: response.degraded(),
            quality: response.quality,
        })
    }

    fn synthetic_quote(&self, request: &DataRequest) -> QuoteResponse {
        let point = self.inner.synthetic.last_bar(request);
        let series = Arc::new(FetchResult::new(vec![point], SourceId::Synthetic, Utc::now()));
        let response = self.respond(series, request, false);
        QuoteResponse {
            symbol: request.symbol().clone(),
            point,
            source_id: SourceId::Synthetic,
            degraded: true,
            quality: response.quality,
        }
    }

    /// Drops every cached series for `symbol`.
    pub async fn invalidate_cache(&self, symbol: &str) -> Result<usize, DataError> {
        let symbol = Symbol::parse(symbol)?;
        Ok(self.inner.cache.invalidate_symbol(symbol.as_str()).await)
    }

    pub async fn clear_cache(&self) {
        self.inner.cache.clear().await
    }

    async fn resolve(
        &self,
        request: &DataRequest,
        class: RequestClass,
        deadline: Option<Instant>,
    ) -> SeriesResponse {
        let inner = &self.inner;
        let key = cache_key(request, class, inner.bucket);

        if let Some(series) = inner.cache.get(&key).await {
            return self.respond(series, request, true);
        }

        let fetched = match deadline {
            Some(deadline) => inner.fetch_from_sources(&key, request, class, Some(deadline)).await,
            None => self.fetch_coalesced(key, request, class).await,
        };

        match fetched {
            Some(series) => self.respond(series, request, false),
            None => self.respond(Arc::new(inner.synthetic.generate(request)), request, false),
        }
    }

    /// Shares one upstream walk between concurrent misses on the same key.
    async fn fetch_coalesced(
        &self,
        key: String,
        request: &DataRequest,
        class: RequestClass,
    ) -> Option<Arc<FetchResult>> {
        let shared = {
            let mut in_flight = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(&key) {
                Some(existing) => {
                    debug!(key = %key, "Joining in-flight fetch");
                    existing.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let request = request.clone();
                    let owned_key = key.clone();
                    let fetch = async move {
                        let outcome = inner
                            .fetch_from_sources(&owned_key, &request, class, None)
                            .await;
                        inner
                            .in_flight
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&owned_key);
                        outcome
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key, fetch.clone());
                    fetch
                }
            }
        };
        shared.await
    }

    fn respond(
        &self,
        series: Arc<FetchResult>,
        request: &DataRequest,
        cached: bool,
    ) -> SeriesResponse {
        let quality = self
            .inner
            .scorer
            .score(&series, request.expected_points(), Utc::now());
        SeriesResponse {
            series,
            quality,
            cached,
        }
    }
}
