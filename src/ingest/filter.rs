use std::sync::Arc;

use thiserror::Error;

use super::catalog::TagCatalog;
use crate::models::{Measurement, RawReading};

/// Why a reading was dropped
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Rejection {
    #[error("tag {tag_code:?} is not in the catalog")]
    UnknownTag { tag_code: String },
    #[error("tag {tag_code:?} has no numeric value")]
    MissingValue { tag_code: String },
    #[error("tag {tag_code:?} value {value} is below minimum {min}")]
    BelowMinimum {
        tag_code: String,
        value: f64,
        min: f64,
    },
    #[error("tag {tag_code:?} value {value} is above maximum {max}")]
    AboveMaximum {
        tag_code: String,
        value: f64,
        max: f64,
    },
}

/// Turns raw readings into measurements using catalog membership and
/// inclusive descriptor bounds
#[derive(Debug, Clone)]
pub struct QualityFilter {
    catalog: Arc<TagCatalog>,
}

impl QualityFilter {
    pub fn new(catalog: Arc<TagCatalog>) -> Self {
        Self { catalog }
    }

    pub fn apply(&self, reading: &RawReading) -> Result<Measurement, Rejection> {
        // The decoder only emits catalog columns; this guards other producers
        let Some(tag) = self.catalog.lookup(&reading.tag_code) else {
            return Err(Rejection::UnknownTag {
                tag_code: reading.tag_code.clone(),
            });
        };

        let missing = || Rejection::MissingValue {
            tag_code: reading.tag_code.clone(),
        };
        let value = reading.value.ok_or_else(missing)?;

        if let Some(min) = tag.min_value {
            if value < min {
                return Err(Rejection::BelowMinimum {
                    tag_code: reading.tag_code.clone(),
                    value,
                    min,
                });
            }
        }
        if let Some(max) = tag.max_value {
            if value > max {
                return Err(Rejection::AboveMaximum {
                    tag_code: reading.tag_code.clone(),
                    value,
                    max,
                });
            }
        }

        Measurement::new(reading.timestamp, tag.tag_id, value).ok_or_else(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TagDescriptor;
    use chrono::{TimeZone, Utc};

    fn filter() -> QualityFilter {
        QualityFilter::new(Arc::new(TagCatalog::from_descriptors(vec![
            TagDescriptor {
                tag_id: 1,
                tag_code: "T1".to_string(),
                min_value: Some(0.0),
                max_value: Some(100.0),
            },
            TagDescriptor {
                tag_id: 2,
                tag_code: "FREE".to_string(),
                min_value: None,
                max_value: None,
            },
            TagDescriptor {
                tag_id: 3,
                tag_code: "FLOOR".to_string(),
                min_value: Some(-10.0),
                max_value: None,
            },
        ])))
    }

    fn reading(tag: &str, value: Option<f64>) -> RawReading {
        RawReading {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            tag_code: tag.to_string(),
            value,
        }
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let f = filter();
        assert_eq!(f.apply(&reading("T1", Some(0.0))).unwrap().value(), 0.0);
        assert_eq!(f.apply(&reading("T1", Some(100.0))).unwrap().value(), 100.0);
        assert_eq!(f.apply(&reading("T1", Some(50.0))).unwrap().tag_id(), 1);
    }

    #[test]
    fn test_out_of_range_is_rejected() {
        let f = filter();
        assert_eq!(
            f.apply(&reading("T1", Some(-0.5))),
            Err(Rejection::BelowMinimum {
                tag_code: "T1".to_string(),
                value: -0.5,
                min: 0.0
            })
        );
        assert_eq!(
            f.apply(&reading("T1", Some(150.0))),
            Err(Rejection::AboveMaximum {
                tag_code: "T1".to_string(),
                value: 150.0,
                max: 100.0
            })
        );
    }

    #[test]
    fn test_missing_bounds_skip_range_check() {
        let f = filter();
        assert!(f.apply(&reading("FREE", Some(-1e9))).is_ok());
        assert!(f.apply(&reading("FREE", Some(1e9))).is_ok());
        assert!(f.apply(&reading("FLOOR", Some(1e9))).is_ok());
        assert!(f.apply(&reading("FLOOR", Some(-11.0))).is_err());
    }

    #[test]
    fn test_unknown_tag_and_missing_value() {
        let f = filter();
        assert!(matches!(
            f.apply(&reading("T9", Some(1.0))),
            Err(Rejection::UnknownTag { .. })
        ));
        assert!(matches!(
            f.apply(&reading("T1", None)),
            Err(Rejection::MissingValue { .. })
        ));
        assert!(matches!(
            f.apply(&reading("FREE", Some(f64::NAN))),
            Err(Rejection::MissingValue { .. })
        ));
    }
}
