use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Sentinel written in place of a rate that must not be shown
pub const REDACTED: &str = "[Redacted]";

/// Code label of the synthetic row that collects suppressed counts
pub const OTHER_CODE: &str = "Other";

/// Group label of the whole-population measure
pub const TOTAL_GROUP: &str = "total";

/// Breakdown that feeds the decile chart and is never redacted
pub const PRACTICE_GROUP: &str = "practice";

/// Counts strictly below this are redacted to zero
pub const DEFAULT_REDACTION_THRESHOLD: u64 = 10;

/// Measure counts are rounded to a multiple of this
pub const MEASURE_ROUNDING_BASE: u64 = 10;

/// Code counts at or below this are grouped into "Other"
pub const DEFAULT_LOW_COUNT_THRESHOLD: u64 = 7;

/// Top-code counts are rounded to a multiple of this
pub const DEFAULT_TOP_CODE_ROUNDING_BASE: u64 = 7;

/// Share of redacted periods above which a category fails the gate
pub const DEFAULT_MAX_REDACTED_FRACTION: f64 = 0.5;

/// Rows kept in a published top-code table
pub const DEFAULT_TOP_N: usize = 5;

/// Rates are expressed per this many people
pub const RATE_PER: f64 = 1000.0;

/// Rate of a measure row, or the redaction sentinel
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MeasureValue {
    Rate(f64),
    Redacted,
}

impl MeasureValue {
    pub fn is_redacted(&self) -> bool {
        matches!(self, MeasureValue::Redacted)
    }

    pub fn rate(&self) -> Option<f64> {
        match self {
            MeasureValue::Rate(r) => Some(*r),
            MeasureValue::Redacted => None,
        }
    }
}

impl fmt::Display for MeasureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasureValue::Rate(r) => write!(f, "{}", r),
            MeasureValue::Redacted => f.write_str(REDACTED),
        }
    }
}

impl FromStr for MeasureValue {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed == REDACTED {
            return Ok(MeasureValue::Redacted);
        }
        match trimmed.parse::<f64>() {
            Ok(r) if r.is_finite() && r >= 0.0 => Ok(MeasureValue::Rate(r)),
            _ => Err(format!("'{}' is neither a rate nor {}", s, REDACTED)),
        }
    }
}

impl Serialize for MeasureValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            MeasureValue::Rate(r) => serializer.serialize_f64(*r),
            MeasureValue::Redacted => serializer.serialize_str(REDACTED),
        }
    }
}

impl<'de> Deserialize<'de> for MeasureValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One row of a measure table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureRow {
    #[serde(rename = "date")]
    pub period: NaiveDate,
    pub event_measure: u64,
    pub population: u64,
    pub group: String,
    pub group_value: String,
    pub value: MeasureValue,
}

/// Number of times a code was recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeCount {
    pub code: String,
    pub num: u64,
}

impl CodeCount {
    pub fn new(code: impl Into<String>, num: u64) -> Self {
        Self {
            code: code.into(),
            num,
        }
    }
}

/// A codelist line mapping a code to its term
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodelistEntry {
    pub code: String,
    pub term: String,
}

/// One point of a period's rate distribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileRow {
    #[serde(rename = "date")]
    pub period: NaiveDate,
    pub percentile: u8,
    pub value: f64,
}

/// A table cell that is either numeric or a label
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Number(f64),
    Label(String),
}

/// One patient row of a period extract
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractRecord {
    pub patient_id: Option<String>,
    pub event_measure: u64,
    pub population: u64,
    /// Categorical columns; missing values are left out
    pub categories: BTreeMap<String, String>,
    /// `count_<code>` columns keyed by code
    pub code_counts: BTreeMap<String, u64>,
}

impl ExtractRecord {
    pub fn category(&self, column: &str) -> Option<&str> {
        self.categories.get(column).map(String::as_str)
    }
}

/// All records of one reporting period
#[derive(Debug, Clone, PartialEq)]
pub struct Extract {
    pub period: NaiveDate,
    /// Header of the source file
    pub columns: Vec<String>,
    pub records: Vec<ExtractRecord>,
}

/// Result type for the application
pub type Result<T> = std::result::Result<T, crate::error::Error>;
