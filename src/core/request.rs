//! Request vocabulary: symbols, periods, sampling intervals

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

use crate::core::error::DataError;

const MAX_SYMBOL_LEN: usize = 15;

/// Length of the regular trading session used to size intraday series, in minutes.
pub const SESSION_MINUTES: i64 = 525;

/// Normalized ticker symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    pub fn parse(input: &str) -> Result<Self, DataError> {
        let normalized = input.trim().to_ascii_uppercase();
        if normalized.is_empty() {
            return Err(DataError::invalid_request("symbol must not be empty"));
        }

        let len = normalized.chars().count();
        if len > MAX_SYMBOL_LEN {
            return Err(DataError::invalid_request(format!(
                "symbol '{normalized}' is {len} characters long, maximum is {MAX_SYMBOL_LEN}"
            )));
        }

        if let Some(first) = normalized.chars().next() {
            if !(first.is_ascii_alphabetic() || first == '^') {
                return Err(DataError::invalid_request(format!(
                    "symbol '{normalized}' must start with a letter or '^'"
                )));
            }
        }

        if let Some(ch) = normalized
            .chars()
            .find(|ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '=' | '^')))
        {
            return Err(DataError::invalid_request(format!(
                "symbol '{normalized}' contains invalid character '{ch}'"
            )));
        }

        Ok(Symbol(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Symbol {
    type Error = DataError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Symbol::parse(&value)
    }
}

impl From<Symbol> for String {
    fn from(value: Symbol) -> Self {
        value.0
    }
}

/// Look-back range of a series request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum Period {
    OneDay,
    FiveDays,
    OneMonth,
    ThreeMonths,
    SixMonths,
    OneYear,
    TwoYears,
    FiveYears,
}

impl Period {
    pub const ALL: [Period; 8] = [
        Period::OneDay,
        Period::FiveDays,
        Period::OneMonth,
        Period::ThreeMonths,
        Period::SixMonths,
        Period::OneYear,
        Period::TwoYears,
        Period::FiveYears,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Period::OneDay => "1d",
            Period::FiveDays => "5d",
            Period::OneMonth => "1mo",
            Period::ThreeMonths => "3mo",
            Period::SixMonths => "6mo",
            Period::OneYear => "1y",
            Period::TwoYears => "2y",
            Period::FiveYears => "5y",
        }
    }

    pub const fn calendar_days(self) -> i64 {
        match self {
            Period::OneDay => 1,
            Period::FiveDays => 5,
            Period::OneMonth => 30,
            Period::ThreeMonths => 91,
            Period::SixMonths => 182,
            Period::OneYear => 365,
            Period::TwoYears => 730,
            Period::FiveYears => 1826,
        }
    }

    pub fn to_duration(self) -> Duration {
        Duration::days(self.calendar_days())
    }

    /// Number of weekdays a period of this length usually spans.
    pub fn trading_days(self) -> usize {
        match self {
            Period::OneDay => 1,
            Period::FiveDays => 5,
            other => ((other.calendar_days() as f64) * 5.0 / 7.0).round() as usize,
        }
    }
}

impl Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1d" => Ok(Period::OneDay),
            "5d" => Ok(Period::FiveDays),
            "1mo" => Ok(Period::OneMonth),
            "3mo" => Ok(Period::ThreeMonths),
            "6mo" => Ok(Period::SixMonths),
            "1y" => Ok(Period::OneYear),
            "2y" => Ok(Period::TwoYears),
            "5y" => Ok(Period::FiveYears),
            _ => Err(DataError::invalid_request(format!("unknown period '{s}'"))),
        }
    }
}

/// Sampling interval of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum Interval {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    Daily,
    Weekly,
}

impl Interval {
    pub const ALL: [Interval; 7] = [
        Interval::OneMinute,
        Interval::FiveMinutes,
        Interval::FifteenMinutes,
        Interval::ThirtyMinutes,
        Interval::OneHour,
        Interval::Daily,
        Interval::Weekly,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Interval::OneMinute => "1m",
            Interval::FiveMinutes => "5m",
            Interval::FifteenMinutes => "15m",
            Interval::ThirtyMinutes => "30m",
            Interval::OneHour => "1h",
            Interval::Daily => "1d",
            Interval::Weekly => "1wk",
        }
    }

    pub const fn minutes(self) -> i64 {
        match self {
            Interval::OneMinute => 1,
            Interval::FiveMinutes => 5,
            Interval::FifteenMinutes => 15,
            Interval::ThirtyMinutes => 30,
            Interval::OneHour => 60,
            Interval::Daily => 24 * 60,
            Interval::Weekly => 7 * 24 * 60,
        }
    }

    pub fn to_duration(self) -> Duration {
        Duration::minutes(self.minutes())
    }

    pub const fn is_intraday(self) -> bool {
        self.minutes() < 24 * 60
    }

    /// Longest period this interval can be requested for.
    fn max_period(self) -> Period {
        match self {
            Interval::OneMinute => Period::FiveDays,
            Interval::FiveMinutes
            | Interval::FifteenMinutes
            | Interval::ThirtyMinutes
            | Interval::OneHour => Period::OneMonth,
            Interval::Daily | Interval::Weekly => Period::FiveYears,
        }
    }

    fn min_period(self) -> Period {
        match self {
            Interval::Weekly => Period::OneMonth,
            _ => Period::OneDay,
        }
    }

    pub fn allows(self, period: Period) -> bool {
        period >= self.min_period() && period <= self.max_period()
    }
}

impl Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1m" | "1min" => Ok(Interval::OneMinute),
            "5m" | "5min" => Ok(Interval::FiveMinutes),
            "15m" | "15min" => Ok(Interval::FifteenMinutes),
            "30m" | "30min" => Ok(Interval::ThirtyMinutes),
            "1h" | "60m" | "60min" => Ok(Interval::OneHour),
            "1d" | "daily" => Ok(Interval::Daily),
            "1wk" | "1w" | "weekly" => Ok(Interval::Weekly),
            _ => Err(DataError::invalid_request(format!("unknown interval '{s}'"))),
        }
    }
}

/// Freshness class of a request; selects the cache TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestClass {
    Quote,
    Intraday,
    Historical,
}

impl RequestClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            RequestClass::Quote => "quote",
            RequestClass::Intraday => "intraday",
            RequestClass::Historical => "historical",
        }
    }
}

/// A validated series request. Immutable once built; fully determines its cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataRequest {
    symbol: Symbol,
    period: Period,
    interval: Interval,
    as_of: DateTime<Utc>,
}

impl DataRequest {
    pub fn new(
        symbol: Symbol,
        period: Period,
        interval: Interval,
        as_of: DateTime<Utc>,
    ) -> Result<Self, DataError> {
        if !interval.allows(period) {
            return Err(DataError::invalid_request(format!(
                "interval {interval} cannot be combined with period {period}"
            )));
        }
        Ok(DataRequest {
            symbol,
            period,
            interval,
            as_of,
        })
    }

    /// Parses user-supplied strings into a request anchored at the current time.
    pub fn parse(symbol: &str, period: &str, interval: &str) -> Result<Self, DataError> {
        Self::new(
            Symbol::parse(symbol)?,
            period.parse()?,
            interval.parse()?,
            Utc::now(),
        )
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn period(&self) -> Period {
        self.period
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn as_of(&self) -> DateTime<Utc> {
        self.as_of
    }

    pub fn class(&self) -> RequestClass {
        if self.interval.is_intraday() {
            RequestClass::Intraday
        } else {
            RequestClass::Historical
        }
    }

    /// Start of the look-back window (exclusive).
    pub fn window_start(&self) -> DateTime<Utc> {
        self.as_of - self.period.to_duration()
    }

    /// Number of points a complete series for this request should carry.
    pub fn expected_points(&self) -> usize {
        let trading_days = self.period.trading_days();
        match self.interval {
            Interval::Daily => trading_days,
            Interval::Weekly => (self.period.calendar_days() as usize).div_ceil(7),
            intraday => trading_days * (SESSION_MINUTES / intraday.minutes()).max(1) as usize,
        }
    }
}
