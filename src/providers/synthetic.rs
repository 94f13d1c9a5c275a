//! Last-resort generator of plausible, reproducible price paths

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::f64::consts::TAU;
use tracing::warn;

use crate::core::config::SyntheticConfig;
use crate::core::request::{DataRequest, Interval, SESSION_MINUTES};
use crate::core::series::{FetchResult, SeriesPoint};
use crate::core::source::SourceId;

const SEED_DOMAIN: &[u8] = b"marketfeed-synthetic";
const SESSION_OPEN: NaiveTime = match NaiveTime::from_hms_opt(7, 0, 0) {
    Some(time) => time,
    None => NaiveTime::MIN,
};
const BASE_VOLUME: f64 = 1_000_000.0;

fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

fn last_weekday_on_or_before(mut date: NaiveDate) -> NaiveDate {
    while !is_weekday(date) {
        date = date.pred_opt().unwrap_or(date);
        if date == NaiveDate::MIN {
            break;
        }
    }
    date
}

fn session_bars(date: NaiveDate, interval: Interval) -> impl Iterator<Item = DateTime<Utc>> {
    let open = date.and_time(SESSION_OPEN).and_utc();
    let step = interval.minutes();
    (0..(SESSION_MINUTES / step).max(1)).map(move |k| open + Duration::minutes(k * step))
}

/// Weekday timestamps covering the request window, never empty.
fn timestamps(request: &DataRequest) -> Vec<DateTime<Utc>> {
    let start = request.window_start();
    let end = request.as_of();
    let in_window = |ts: &DateTime<Utc>| *ts > start && *ts <= end;
    let dates = start
        .date_naive()
        .iter_days()
        .take_while(|date| *date <= end.date_naive());
    let midnight = |date: NaiveDate| date.and_time(NaiveTime::MIN).and_utc();

    let stamps: Vec<DateTime<Utc>> = match request.interval() {
        Interval::Daily => dates
            .filter(|d| is_weekday(*d))
            .map(midnight)
            .filter(in_window)
            .collect(),
        Interval::Weekly => dates
            .filter(|d| d.weekday() == Weekday::Mon)
            .map(midnight)
            .filter(in_window)
            .collect(),
        intraday => dates
            .filter(|d| is_weekday(*d))
            .flat_map(|d| session_bars(d, intraday))
            .filter(in_window)
            .collect(),
    };
    if !stamps.is_empty() {
        return stamps;
    }

    let fallback = last_weekday_on_or_before(end.date_naive());
    match request.interval() {
        Interval::Daily => vec![midnight(fallback)],
        Interval::Weekly => {
            let since_monday = fallback.weekday().num_days_from_monday() as i64;
            let monday = fallback - Duration::days(since_monday);
            vec![midnight(monday)]
        }
        intraday => session_bars(fallback, intraday).collect(),
    }
}

/// Standard normal draw (Box–Muller).
fn standard_normal(rng: &mut ChaCha8Rng) -> f64 {
    let u1: f64 = 1.0 - rng.random::<f64>();
    let u2: f64 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
}

/// Scales per-day volatility to one step of `interval`.
fn step_scale(interval: Interval) -> f64 {
    match interval {
        Interval::Daily => 1.0,
        Interval::Weekly => 5.0_f64.sqrt(),
        intraday => (intraday.minutes() as f64 / SESSION_MINUTES as f64).sqrt(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyntheticGenerator {
    config: SyntheticConfig,
}

impl SyntheticGenerator {
    pub fn new(config: SyntheticConfig) -> Self {
        SyntheticGenerator { config }
    }

    fn seed(symbol: &str) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(SEED_DOMAIN);
        hasher.update(symbol.as_bytes());
        *hasher.finalize().as_bytes()
    }

    fn base_price(&self) -> f64 {
        if self.config.base_price.is_finite() && self.config.base_price > 0.0 {
            self.config.base_price
        } else {
            100.0
        }
    }

    /// Latest bar of the walk for `request`.
    pub fn last_bar(&self, request: &DataRequest) -> SeriesPoint {
        match self.generate(request).last_point() {
            Some(point) => *point,
            None => {
                let price = self.base_price();
                SeriesPoint::new(request.as_of(), price, price, price, price, 0)
            }
        }
    }

    /// Builds a lognormal walk for the request. Always succeeds.
    pub fn generate(&self, request: &DataRequest) -> FetchResult {
        let symbol = request.symbol().as_str();
        warn!(symbol, interval = %request.interval(), "Serving synthetic series");

        let mut rng = ChaCha8Rng::from_seed(Self::seed(symbol));
        let mut close = self.base_price() * rng.random_range(0.5..2.0);

        let scale = step_scale(request.interval());
        let volatility = self.config.volatility.abs() * scale;
        let drift = self.config.drift * scale * scale;

        let points = timestamps(request)
            .into_iter()
            .map(|timestamp| {
                let open = close;
                close = (open * (drift + volatility * standard_normal(&mut rng)).exp()).max(0.01);
                let upper = open.max(close);
                let lower = open.min(close);
                let high = upper * (1.0 + rng.random::<f64>() * volatility * 0.5);
                let low = (lower * (1.0 - rng.random::<f64>() * volatility * 0.5)).max(lower * 0.5);
                let volume = (BASE_VOLUME * scale * rng.random_range(0.5..1.5)).round() as u64;
                SeriesPoint::new(timestamp, open, high, low, close, volume)
            })
            .collect();

        FetchResult::new(points, SourceId::Synthetic, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::request::{Period, Symbol};
    use crate::core::validate::Validator;
    use chrono::TimeZone;

    fn request(
        symbol: &str,
        period: Period,
        interval: Interval,
        as_of: DateTime<Utc>,
    ) -> DataRequest {
        DataRequest::new(Symbol::parse(symbol).unwrap(), period, interval, as_of).unwrap()
    }

    fn wednesday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 6, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_daily_series_is_valid_and_weekday_only() {
        let req = request("ABC", Period::OneMonth, Interval::Daily, wednesday());
        let result = SyntheticGenerator::default().generate(&req);

        assert_eq!(result.source_id, SourceId::Synthetic);
        assert!(result.degraded);
        assert!(!result.points.is_empty());
        assert!(
            result
                .points
                .iter()
                .all(|p| is_weekday(p.timestamp.date_naive()))
        );
        assert!(Validator::new(Interval::Daily).check(&result).is_ok());
    }

    #[test]
    fn test_last_bar_matches_generated_series() {
        let generator = SyntheticGenerator::default();
        let req = request("ABC", Period::FiveDays, Interval::Daily, wednesday());
        let series = generator.generate(&req);
        assert_eq!(Some(&generator.last_bar(&req)), series.points.last());
    }

    #[test]
    fn test_generation_is_reproducible_per_symbol() {
        let generator = SyntheticGenerator::default();
        let req = request("ABC", Period::ThreeMonths, Interval::Daily, wednesday());
        let a = generator.generate(&req);
        let b = generator.generate(&req);
        assert_eq!(a.points, b.points);

        let other_req = request("XYZ", Period::ThreeMonths, Interval::Daily, wednesday());
        let other = generator.generate(&other_req);
        assert_ne!(a.points, other.points);
    }

    #[test]
    fn test_weekend_one_day_request_is_not_empty() {
        let sunday = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let result =
            SyntheticGenerator::default().generate(&request(
                "ABC",
                Period::OneDay,
                Interval::Daily,
                sunday,
            ));
        assert_eq!(result.points.len(), 1);
        assert_eq!(
            result.points[0].timestamp,
            Utc.with_ymd_and_hms(2024, 3, 8, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_intraday_and_weekly_series_are_valid() {
        let generator = SyntheticGenerator::default();
        for (period, interval) in [
            (Period::FiveDays, Interval::FiveMinutes),
            (Period::OneDay, Interval::OneHour),
            (Period::OneYear, Interval::Weekly),
        ] {
            let result = generator.generate(&request("ABC", period, interval, wednesday()));
            assert!(!result.points.is_empty());
            assert!(Validator::new(interval).check(&result).is_ok());
        }
    }

    #[test]
    fn test_bad_base_price_falls_back() {
        let generator = SyntheticGenerator::new(SyntheticConfig {
            base_price: -5.0,
            ..SyntheticConfig::default()
        });
        let req = request("ABC", Period::OneMonth, Interval::Daily, wednesday());
        let result = generator.generate(&req);
        assert!(result.points.iter().all(|p| p.low > 0.0));
    }
}
