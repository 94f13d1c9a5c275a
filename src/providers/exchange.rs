//! Primary source: the exchange's ISS candle feed

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::core::error::FetchError;
use crate::core::request::{DataRequest, Interval};
use crate::core::series::{FetchResult, SeriesPoint};
use crate::core::source::{SeriesSource, SourceId};
use crate::providers::limiter::RateLimiter;
use crate::providers::util::{get_text, http_client};

/// Rows per ISS page; a full page means more may follow.
const PAGE_SIZE: usize = 500;
const MAX_PAGES: usize = 20;
const EXCHANGE_UTC_OFFSET_SECS: i32 = 3 * 3600;

#[derive(Debug, Deserialize)]
struct CandlesResponse {
    candles: Table,
}

#[derive(Debug, Deserialize)]
struct Table {
    columns: Vec<String>,
    data: Vec<Vec<Value>>,
}

struct Columns {
    open: usize,
    high: usize,
    low: usize,
    close: usize,
    volume: usize,
    begin: usize,
}

impl Columns {
    fn locate(columns: &[String]) -> Result<Self, FetchError> {
        let find = |name: &str| {
            columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(name))
                .ok_or_else(|| {
                    FetchError::Malformed(format!("candles table has no '{name}' column"))
                })
        };
        Ok(Columns {
            open: find("open")?,
            high: find("high")?,
            low: find("low")?,
            close: find("close")?,
            volume: find("volume")?,
            begin: find("begin")?,
        })
    }
}

fn interval_code(interval: Interval) -> Option<u32> {
    match interval {
        Interval::OneMinute => Some(1),
        Interval::OneHour => Some(60),
        Interval::Daily => Some(24),
        Interval::Weekly => Some(7),
        _ => None,
    }
}

fn number(row: &[Value], index: usize, name: &str) -> Result<f64, FetchError> {
    row.get(index)
        .and_then(Value::as_f64)
        .ok_or_else(|| {
            FetchError::Malformed(format!("candle field '{name}' is missing or not numeric"))
        })
}

/// Exchange timestamps are local exchange time. Daily and weekly bars keep
/// their calendar date at midnight UTC.
fn parse_begin(raw: &str, interval: Interval) -> Result<DateTime<Utc>, FetchError> {
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map_err(|e| FetchError::Malformed(format!("bad candle timestamp '{raw}': {e}")))?;
    if !interval.is_intraday() {
        return Ok(naive.date().and_time(chrono::NaiveTime::MIN).and_utc());
    }
    let offset = FixedOffset::east_opt(EXCHANGE_UTC_OFFSET_SECS)
        .ok_or_else(|| FetchError::Malformed("invalid exchange offset".to_string()))?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| FetchError::Malformed(format!("ambiguous candle timestamp '{raw}'")))
}

fn parse_rows(table: &Table, interval: Interval) -> Result<Vec<SeriesPoint>, FetchError> {
    let columns = Columns::locate(&table.columns)?;
    table
        .data
        .iter()
        .map(|row| {
            let begin = row
                .get(columns.begin)
                .and_then(Value::as_str)
                .ok_or_else(|| FetchError::Malformed("candle has no begin time".to_string()))?;
            Ok(SeriesPoint::new(
                parse_begin(begin, interval)?,
                number(row, columns.open, "open")?,
                number(row, columns.high, "high")?,
                number(row, columns.low, "low")?,
                number(row, columns.close, "close")?,
                number(row, columns.volume, "volume")?.max(0.0).round() as u64,
            ))
        })
        .collect()
}

/// Candle feed that pages through the ISS table.
///
/// Every page is its own request, so pages after the first wait on `limiter`
/// too. Pass the limiter the service fetches through, or the spacing it
/// enforces between pages is lost.
pub struct ExchangeSource {
    base_url: String,
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
}

impl ExchangeSource {
    pub fn new(base_url: &str, limiter: Arc<RateLimiter>) -> Self {
        ExchangeSource {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: http_client(),
            limiter,
        }
    }

    fn page_url(&self, request: &DataRequest, code: u32, start: usize) -> String {
        format!(
            "{}/engines/stock/markets/shares/securities/{}/candles.json?interval={}&from={}&till={}&start={}&iss.meta=off",
            self.base_url,
            request.symbol(),
            code,
            request.window_start().format("%Y-%m-%d"),
            request.as_of().format("%Y-%m-%d"),
            start
        )
    }
}

#[async_trait]
impl SeriesSource for ExchangeSource {
    fn id(&self) -> SourceId {
        SourceId::Primary
    }

    fn supports(&self, interval: Interval) -> bool {
        interval_code(interval).is_some()
    }

    #[instrument(
        name = "ExchangeFetch",
        skip(self, request),
        fields(symbol = %request.symbol(), interval = %request.interval())
    )]
    async fn fetch_series(&self, request: &DataRequest) -> Result<FetchResult, FetchError> {
        let code = interval_code(request.interval())
            .ok_or(FetchError::Unsupported(request.interval()))?;

        let mut points = Vec::new();
        for page in 0..MAX_PAGES {
            // The caller paced the first page.
            if page > 0 {
                self.limiter.acquire(SourceId::Primary).await;
            }
            let url = self.page_url(request, code, page * PAGE_SIZE);
            let body = get_text(&self.client, &url).await?;
            let response: CandlesResponse = serde_json::from_str(&body)
                .map_err(|e| FetchError::Malformed(format!("candles payload: {e}")))?;

            let rows = parse_rows(&response.candles, request.interval())?;
            let full_page = rows.len() >= PAGE_SIZE;
            points.extend(rows);
            if !full_page {
                break;
            }
        }

        debug!(points = points.len(), "Parsed exchange candles");
        Ok(FetchResult::new(points, SourceId::Primary, Utc::now()))
    }
}
