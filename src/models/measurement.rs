use chrono::{DateTime, Utc};
use serde::Serialize;

/// Validation metadata for a registered sensor tag
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TagDescriptor {
    pub tag_id: i64,
    pub tag_code: String,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
}

/// One decoded spreadsheet cell before validation
#[derive(Debug, Clone, PartialEq)]
pub struct RawReading {
    pub timestamp: DateTime<Utc>,
    pub tag_code: String,
    pub value: Option<f64>,
}

/// A validated reading ready for persistence.
///
/// The value is never NaN. Bounds are checked by the quality filter before
/// construction, so a `Measurement` is always within its tag's range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    timestamp: DateTime<Utc>,
    tag_id: i64,
    value: f64,
}

impl Measurement {
    /// Returns `None` when `value` is NaN.
    pub fn new(timestamp: DateTime<Utc>, tag_id: i64, value: f64) -> Option<Self> {
        if value.is_nan() {
            return None;
        }
        Some(Self {
            timestamp,
            tag_id,
            value,
        })
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn tag_id(&self) -> i64 {
        self.tag_id
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

/// Counters collected while ingesting a single file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileReport {
    /// Data rows visited from the data start row onward
    pub rows_seen: usize,
    /// Rows dropped because the timestamp could not be built
    pub rows_skipped: usize,
    /// Cells dropped because the value was not numeric
    pub cells_skipped: usize,
    /// Raw readings produced by the decoder
    pub readings: usize,
    pub accepted: usize,
    pub rejected: usize,
    /// Committed upsert transactions
    pub batches: usize,
    /// Header columns whose tag code is not in the catalog
    pub unrecognized_tags: Vec<String>,
    /// Derived views that failed to refresh
    pub views_failed: Vec<String>,
}
