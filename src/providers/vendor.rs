//! Tertiary source: a keyed time-series vendor API

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::core::error::FetchError;
use crate::core::request::{DataRequest, Interval};
use crate::core::series::{FetchResult, SeriesPoint};
use crate::core::source::{SeriesSource, SourceId};
use crate::providers::util::{get_text, http_client};

const DEMO_KEY: &str = "demo";
const COMPACT_ROWS: usize = 100;
/// The vendor's throttle window is one minute.
const THROTTLE_HINT: Duration = Duration::from_secs(60);
const VENDOR_UTC_OFFSET_SECS: i32 = -5 * 3600;
/// Wording the vendor uses when a notice is about call volume.
const THROTTLE_MARKERS: [&str; 3] = ["api call frequency", "rate limit", "requests per"];

fn is_throttle_notice(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    THROTTLE_MARKERS.iter().any(|marker| message.contains(marker))
}

fn number_or_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("number out of range")),
        Value::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!("expected number, got {other}"))),
    }
}

#[derive(Debug, Deserialize)]
struct Bar {
    #[serde(rename = "1. open", deserialize_with = "number_or_string")]
    open: f64,
    #[serde(rename = "2. high", deserialize_with = "number_or_string")]
    high: f64,
    #[serde(rename = "3. low", deserialize_with = "number_or_string")]
    low: f64,
    #[serde(rename = "4. close", deserialize_with = "number_or_string")]
    close: f64,
    #[serde(rename = "5. volume", deserialize_with = "number_or_string")]
    volume: f64,
}

fn function_for(interval: Interval) -> Option<(&'static str, Option<&'static str>)> {
    match interval {
        Interval::FiveMinutes => Some(("TIME_SERIES_INTRADAY", Some("5min"))),
        Interval::FifteenMinutes => Some(("TIME_SERIES_INTRADAY", Some("15min"))),
        Interval::ThirtyMinutes => Some(("TIME_SERIES_INTRADAY", Some("30min"))),
        Interval::OneHour => Some(("TIME_SERIES_INTRADAY", Some("60min"))),
        Interval::Daily => Some(("TIME_SERIES_DAILY", None)),
        Interval::Weekly => Some(("TIME_SERIES_WEEKLY", None)),
        Interval::OneMinute => None,
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, FetchError> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date.and_time(chrono::NaiveTime::MIN).and_utc());
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map_err(|e| FetchError::Malformed(format!("bad vendor timestamp '{raw}': {e}")))?;
    FixedOffset::east_opt(VENDOR_UTC_OFFSET_SECS)
        .and_then(|offset| offset.from_local_datetime(&naive).single())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| FetchError::Malformed(format!("unresolvable vendor timestamp '{raw}'")))
}

/// Turns the vendor's keyed payload into points, or the in-body error it carries.
fn parse_body(body: &str, request: &DataRequest) -> Result<Vec<SeriesPoint>, FetchError> {
    let payload: HashMap<String, Value> = serde_json::from_str(body)
        .map_err(|e| FetchError::Malformed(format!("vendor payload: {e}")))?;

    if let Some(message) = payload.get("Error Message").and_then(Value::as_str) {
        return Err(FetchError::Upstream {
            status: 200,
            message: message.to_string(),
        });
    }
    let notice = ["Note", "Information"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str));
    if let Some(message) = notice.filter(|message| is_throttle_notice(message)) {
        return Err(FetchError::rate_limited(message, Some(THROTTLE_HINT)));
    }

    let Some(series) = payload
        .iter()
        .find(|(key, _)| key.starts_with("Time Series"))
        .map(|(_, value)| value.clone())
    else {
        // Premium-only endpoints and key problems arrive as notices too.
        return Err(match notice {
            Some(message) => FetchError::Upstream {
                status: 200,
                message: message.to_string(),
            },
            None => FetchError::Malformed("no time series in vendor payload".to_string()),
        });
    };
    if let Some(message) = notice {
        warn!(%message, "Vendor notice alongside data");
    }
    let bars: BTreeMap<String, Bar> = serde_json::from_value(series)
        .map_err(|e| FetchError::Malformed(format!("vendor bars: {e}")))?;

    let window_start = request.window_start();
    let mut points = Vec::with_capacity(bars.len());
    for (raw, bar) in bars {
        let timestamp = parse_timestamp(&raw)?;
        if timestamp <= window_start || timestamp > request.as_of() {
            continue;
        }
        points.push(SeriesPoint::new(
            timestamp,
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            bar.volume.max(0.0).round() as u64,
        ));
    }
    points.sort_by_key(|p| p.timestamp);
    Ok(points)
}

pub struct VendorSource {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl VendorSource {
    pub fn new(base_url: &str, api_key: Option<&str>) -> Self {
        VendorSource {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.unwrap_or(DEMO_KEY).to_string(),
            client: http_client(),
        }
    }

    fn url(&self, request: &DataRequest, function: &str, interval: Option<&str>) -> String {
        let outputsize = if request.expected_points() <= COMPACT_ROWS {
            "compact"
        } else {
            "full"
        };
        let mut url = format!(
            "{}/query?function={}&symbol={}&outputsize={}&apikey={}",
            self.base_url,
            function,
            request.symbol(),
            outputsize,
            self.api_key
        );
        if let Some(interval) = interval {
            url.push_str("&interval=");
            url.push_str(interval);
        }
        url
    }
}

#[async_trait]
impl SeriesSource for VendorSource {
    fn id(&self) -> SourceId {
        SourceId::Tertiary
    }

    fn supports(&self, interval: Interval) -> bool {
        function_for(interval).is_some()
    }

    #[instrument(
        name = "VendorFetch",
        skip(self, request),
        fields(symbol = %request.symbol(), interval = %request.interval())
    )]
    async fn fetch_series(&self, request: &DataRequest) -> Result<FetchResult, FetchError> {
        let (function, interval) = function_for(request.interval())
            .ok_or(FetchError::Unsupported(request.interval()))?;

        let body = get_text(&self.client, &self.url(request, function, interval)).await?;
        let points = parse_body(&body, request)?;
        debug!(points = points.len(), "Parsed vendor series");
        Ok(FetchResult::new(points, SourceId::Tertiary, Utc::now()))
    }
}
