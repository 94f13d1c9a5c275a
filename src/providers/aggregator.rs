//! Secondary source: a general-purpose chart API

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::core::error::FetchError;
use crate::core::request::{DataRequest, Interval};
use crate::core::series::{FetchResult, SeriesPoint};
use crate::core::source::{SeriesSource, SourceId};
use crate::providers::util::{get_text, http_client};

#[derive(Deserialize, Debug)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Deserialize, Debug)]
struct ChartResult {
    result: Option<Vec<ChartItem>>,
    error: Option<ChartError>,
}

#[derive(Deserialize, Debug)]
struct ChartError {
    code: String,
    description: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ChartItem {
    timestamp: Option<Vec<i64>>,
    indicators: Option<Indicators>,
}

#[derive(Deserialize, Debug)]
struct Indicators {
    quote: Vec<Quote>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct Quote {
    open: Vec<Option<f64>>,
    high: Vec<Option<f64>>,
    low: Vec<Option<f64>>,
    close: Vec<Option<f64>>,
    volume: Vec<Option<f64>>,
}

fn interval_param(interval: Interval) -> &'static str {
    match interval {
        Interval::OneHour => "60m",
        other => other.as_str(),
    }
}

/// Zips the parallel arrays, skipping rows where any price is null.
///
/// During market hours the last intraday row is the live bar, stamped at the
/// current time rather than on the interval grid. It is dropped when it sits
/// closer than one interval to the bar before it.
fn extract_points(item: &ChartItem, interval: Interval) -> Vec<SeriesPoint> {
    let (Some(timestamps), Some(quote)) = (
        item.timestamp.as_ref(),
        item.indicators.as_ref().and_then(|inds| inds.quote.first()),
    ) else {
        return Vec::new();
    };

    let cell = |column: &[Option<f64>], index: usize| column.get(index).copied().flatten();
    let mut points: Vec<SeriesPoint> = timestamps
        .iter()
        .enumerate()
        .filter_map(|(index, ts)| {
            let timestamp = Utc.timestamp_opt(*ts, 0).single()?;
            Some(SeriesPoint::new(
                timestamp,
                cell(&quote.open, index)?,
                cell(&quote.high, index)?,
                cell(&quote.low, index)?,
                cell(&quote.close, index)?,
                cell(&quote.volume, index).unwrap_or(0.0).max(0.0).round() as u64,
            ))
        })
        .collect();

    let live_bar = interval.is_intraday()
        && matches!(
            points.as_slice(),
            [.., previous, last] if last.timestamp - previous.timestamp < interval.to_duration()
        );
    if live_bar {
        if let Some(bar) = points.pop() {
            debug!(timestamp = %bar.timestamp, "Dropping unaligned live bar");
        }
    }
    points
}

pub struct AggregatorSource {
    base_url: String,
    client: reqwest::Client,
}

impl AggregatorSource {
    pub fn new(base_url: &str) -> Self {
        AggregatorSource {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: http_client(),
        }
    }
}

#[async_trait]
impl SeriesSource for AggregatorSource {
    fn id(&self) -> SourceId {
        SourceId::Secondary
    }

    #[instrument(
        name = "AggregatorFetch",
        skip(self, request),
        fields(symbol = %request.symbol(), interval = %request.interval())
    )]
    async fn fetch_series(&self, request: &DataRequest) -> Result<FetchResult, FetchError> {
        let url = format!(
            "{}/v8/finance/chart/{}?interval={}&range={}",
            self.base_url,
            request.symbol(),
            interval_param(request.interval()),
            request.period()
        );

        let body = get_text(&self.client, &url).await?;
        let data: ChartResponse = serde_json::from_str(&body)
            .map_err(|e| FetchError::Malformed(format!("chart payload: {e}")))?;

        if let Some(error) = data.chart.error {
            let description = error.description.unwrap_or_default();
            let throttled = [error.code.as_str(), description.as_str()]
                .iter()
                .any(|text| text.contains("Too Many Requests"));
            if throttled {
                return Err(FetchError::rate_limited(description, None));
            }
            return Err(FetchError::Upstream {
                status: 200,
                message: format!("{}: {}", error.code, description),
            });
        }

        let item = data
            .chart
            .result
            .and_then(|items| items.into_iter().next())
            .ok_or_else(|| {
                FetchError::Malformed(format!("no chart data for {}", request.symbol()))
            })?;

        let points = extract_points(&item, request.interval());
        debug!(points = points.len(), "Parsed chart series");
        Ok(FetchResult::new(points, SourceId::Secondary, Utc::now()))
    }
}
