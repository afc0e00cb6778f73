//! Spreadsheet cell values and their conversion rules.
//!
//! Date serials count days from 1899-12-30. Day 60 in the 1900 system is the
//! nonexistent 1900-02-29, so anchoring one day before 1899-12-31 lines every
//! serial after it up with the real calendar.

use calamine::Data;
use chrono::{Days, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CellError {
    #[error("cell is empty")]
    Empty,
    #[error("not a number: {0:?}")]
    NotNumeric(String),
    #[error("date serial {0} out of range")]
    DateSerialOutOfRange(f64),
    #[error("time serial {0} out of range")]
    TimeSerialOutOfRange(f64),
    #[error("unrecognized date {0:?}")]
    UnparsableDate(String),
    #[error("unrecognized time {0:?}, expected HH:MM[:SS]")]
    UnparsableTime(String),
}

/// A decoded cell
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Number(f64),
    Text(String),
    Temporal(NaiveDateTime),
    Empty,
}

impl From<&Data> for CellValue {
    fn from(data: &Data) -> Self {
        match data {
            Data::Int(i) => Self::Number(*i as f64),
            Data::Float(f) => Self::Number(*f),
            Data::Bool(b) => Self::Number(if *b { 1.0 } else { 0.0 }),
            Data::String(s) if s.trim().is_empty() => Self::Empty,
            Data::String(s) => Self::Text(s.clone()),
            Data::DateTime(dt) => match datetime_from_serial(dt.as_f64()) {
                Some(value) => Self::Temporal(value),
                None => Self::Number(dt.as_f64()),
            },
            Data::DateTimeIso(s) | Data::DurationIso(s) => Self::Text(s.clone()),
            Data::Error(e) => Self::Text(format!("#{e:?}")),
            Data::Empty => Self::Empty,
        }
    }
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Text used to look a header cell up in the tag catalog.
    ///
    /// Whole numbers render without a fractional part, so a numeric tag code
    /// `101` matches the catalog entry "101".
    pub fn header_text(&self) -> Option<String> {
        match self {
            Self::Empty => None,
            Self::Text(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => Some(format!("{}", *n as i64)),
            Self::Number(n) => Some(n.to_string()),
            Self::Temporal(dt) => Some(dt.to_string()),
        }
    }

    pub fn to_number(&self) -> Result<f64, CellError> {
        match self {
            Self::Number(n) => Ok(*n),
            Self::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| CellError::NotNumeric(s.clone())),
            Self::Temporal(dt) => Err(CellError::NotNumeric(dt.to_string())),
            Self::Empty => Err(CellError::Empty),
        }
    }

    pub fn to_date(&self) -> Result<NaiveDate, CellError> {
        match self {
            Self::Number(serial) => {
                date_from_serial(*serial).ok_or(CellError::DateSerialOutOfRange(*serial))
            }
            Self::Temporal(dt) => Ok(dt.date()),
            Self::Text(s) => parse_date_text(s).ok_or_else(|| CellError::UnparsableDate(s.clone())),
            Self::Empty => Err(CellError::Empty),
        }
    }

    pub fn to_time(&self) -> Result<NaiveTime, CellError> {
        match self {
            Self::Number(serial) => {
                time_from_serial(*serial).ok_or(CellError::TimeSerialOutOfRange(*serial))
            }
            // Sub-second precision is dropped, matching the serial conversion
            Self::Temporal(dt) => Ok(dt.time().with_nanosecond(0).unwrap_or(dt.time())),
            Self::Text(s) => parse_time_text(s).ok_or_else(|| CellError::UnparsableTime(s.clone())),
            Self::Empty => Err(CellError::Empty),
        }
    }
}

const SECONDS_PER_DAY: u32 = 86_400;
const MILLIS_PER_DAY: f64 = 86_400_000.0;

fn excel_epoch() -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(1899, 12, 30)
}

/// Whole days of `serial` after 1899-12-30. The fractional part is ignored.
pub fn date_from_serial(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial < 0.0 || serial > 2_958_465.0 {
        return None;
    }
    excel_epoch()?.checked_add_days(Days::new(serial.trunc() as u64))
}

/// Time of day from the fractional part of `serial`.
///
/// Excel keeps times to the millisecond, so the fraction is rounded to whole
/// milliseconds first (stored serials are off by float noise either way) and
/// then truncated to whole seconds.
pub fn time_from_serial(serial: f64) -> Option<NaiveTime> {
    if !serial.is_finite() || serial < 0.0 {
        return None;
    }
    let millis = (serial.fract() * MILLIS_PER_DAY).round() as u32;
    let seconds = (millis / 1_000).min(SECONDS_PER_DAY - 1);
    NaiveTime::from_num_seconds_from_midnight_opt(seconds, 0)
}

pub fn datetime_from_serial(serial: f64) -> Option<NaiveDateTime> {
    Some(date_from_serial(serial)?.and_time(time_from_serial(serial)?))
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d"];

/// Parse the date part of a textual date or date-time.
///
/// Only year-first layouts are accepted; ambiguous day/month orders are not
/// guessed.
pub fn parse_date_text(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_local().date());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|dt| dt.date())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
        })
}

const TIME_FORMATS: &[&str] = &["%H:%M", "%H:%M:%S", "%H:%M:%S%.f"];

/// Parse `HH:MM` or `HH:MM:SS`; fractional seconds are dropped
pub fn parse_time_text(text: &str) -> Option<NaiveTime> {
    let text = text.trim();
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(text, fmt).ok())
        .and_then(|t| t.with_nanosecond(0))
}
