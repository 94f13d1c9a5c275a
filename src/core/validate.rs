//! Structural checks on fetched series

use chrono::Duration;
use std::fmt::Display;

use crate::core::error::FetchError;
use crate::core::request::Interval;
use crate::core::series::{FetchResult, SeriesPoint};

const MAX_REPORTED: usize = 16;

/// A single structural defect in a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    Empty,
    NonFinitePrice { index: usize },
    NonPositivePrice { index: usize },
    HighBelowLow { index: usize },
    OpenOutOfRange { index: usize },
    CloseOutOfRange { index: usize },
    NotIncreasing { index: usize },
    TooDense { index: usize },
    DegradedMismatch,
}

impl Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::Empty => write!(f, "series is empty"),
            Violation::NonFinitePrice { index } => write!(f, "point {index}: price is not finite"),
            Violation::NonPositivePrice { index } => {
                write!(f, "point {index}: price is not positive")
            }
            Violation::HighBelowLow { index } => write!(f, "point {index}: high is below low"),
            Violation::OpenOutOfRange { index } => {
                write!(f, "point {index}: open outside low..high")
            }
            Violation::CloseOutOfRange { index } => {
                write!(f, "point {index}: close outside low..high")
            }
            Violation::NotIncreasing { index } => {
                write!(f, "point {index}: timestamp does not increase")
            }
            Violation::TooDense { index } => {
                write!(f, "point {index}: closer to its predecessor than the interval allows")
            }
            Violation::DegradedMismatch => write!(f, "degraded flag disagrees with source"),
        }
    }
}

/// Checks a [`FetchResult`] against the OHLC and ordering invariants for one interval.
#[derive(Debug, Clone, Copy)]
pub struct Validator {
    min_spacing: Duration,
}

impl Validator {
    pub fn new(interval: Interval) -> Self {
        Validator {
            min_spacing: interval.to_duration() / 2,
        }
    }

    /// Returns every violation found, up to a small cap. An empty list means the series is sound.
    pub fn violations(&self, result: &FetchResult) -> Vec<Violation> {
        let mut found = Vec::new();

        if result.degraded != result.source_id.is_synthetic() {
            found.push(Violation::DegradedMismatch);
        }
        if result.points.is_empty() {
            found.push(Violation::Empty);
            return found;
        }

        for (index, point) in result.points.iter().enumerate() {
            check_point(index, point, &mut found);
            if index > 0 {
                let gap = point.timestamp - result.points[index - 1].timestamp;
                if gap <= Duration::zero() {
                    found.push(Violation::NotIncreasing { index });
                } else if gap < self.min_spacing {
                    found.push(Violation::TooDense { index });
                }
            }
            if found.len() >= MAX_REPORTED {
                found.truncate(MAX_REPORTED);
                break;
            }
        }

        found
    }

    pub fn check(&self, result: &FetchResult) -> Result<(), FetchError> {
        let violations = self.violations(result);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(FetchError::Validation(violations))
        }
    }
}

fn check_point(index: usize, point: &SeriesPoint, found: &mut Vec<Violation>) {
    let prices = [point.open, point.high, point.low, point.close];
    if prices.iter().any(|p| !p.is_finite()) {
        found.push(Violation::NonFinitePrice { index });
        return;
    }
    if prices.iter().any(|p| *p <= 0.0) {
        found.push(Violation::NonPositivePrice { index });
    }
    if point.high < point.low {
        found.push(Violation::HighBelowLow { index });
        return;
    }
    if point.open < point.low || point.open > point.high {
        found.push(Violation::OpenOutOfRange { index });
    }
    if point.close < point.low || point.close > point.high {
        found.push(Violation::CloseOutOfRange { index });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::source::SourceId;
    use chrono::{DateTime, TimeZone, Utc};

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    fn bar(n: i64, close: f64) -> SeriesPoint {
        SeriesPoint::new(day(n), close, close + 1.0, close - 1.0, close, 1_000)
    }

    fn result(points: Vec<SeriesPoint>) -> FetchResult {
        FetchResult::new(points, SourceId::Primary, Utc::now())
    }

    #[test]
    fn test_valid_series_passes() {
        let series = result((0..10).map(|n| bar(n, 100.0 + n as f64)).collect());
        assert!(Validator::new(Interval::Daily).check(&series).is_ok());
    }

    #[test]
    fn test_empty_series_fails() {
        let violations = Validator::new(Interval::Daily).violations(&result(vec![]));
        assert_eq!(violations, vec![Violation::Empty]);
    }

    #[test]
    fn test_ohlc_violations_are_reported() {
        let mut broken = bar(1, 100.0);
        broken.high = 98.0;
        let mut open_high = bar(2, 100.0);
        open_high.open = 150.0;
        let mut negative = bar(3, 100.0);
        negative.low = -1.0;
        let mut nan = bar(4, 100.0);
        nan.close = f64::NAN;

        let violations = Validator::new(Interval::Daily)
            .violations(&result(vec![bar(0, 100.0), broken, open_high, negative, nan]));
        assert_eq!(
            violations,
            vec![
                Violation::HighBelowLow { index: 1 },
                Violation::OpenOutOfRange { index: 2 },
                Violation::NonPositivePrice { index: 3 },
                Violation::NonFinitePrice { index: 4 },
            ]
        );
    }

    #[test]
    fn test_ordering_and_density() {
        let mut dense = bar(1, 100.0);
        dense.timestamp = day(1) - Duration::hours(20);
        let violations = Validator::new(Interval::Daily).violations(&result(vec![
            bar(0, 100.0),
            dense,
            bar(2, 100.0),
            bar(2, 100.0),
        ]));
        assert_eq!(
            violations,
            vec![
                Violation::TooDense { index: 1 },
                Violation::NotIncreasing { index: 3 },
            ]
        );
    }

    #[test]
    fn test_degraded_flag_must_match_source() {
        let mut series = result(vec![bar(0, 100.0)]);
        series.degraded = true;
        assert_eq!(
            Validator::new(Interval::Daily).violations(&series),
            vec![Violation::DegradedMismatch]
        );
    }

    #[test]
    fn test_check_wraps_violations() {
        let err = Validator::new(Interval::Daily)
            .check(&result(vec![]))
            .unwrap_err();
        assert_eq!(err, FetchError::Validation(vec![Violation::Empty]));
    }
}
