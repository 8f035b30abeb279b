//! Half-open, timezone-aware date ranges
//!
//! A [`DateRange`] is `[start, end)` in UTC with `start < end`. Empty,
//! reversed and unbounded ranges cannot be constructed. The canonical
//! string form is `"<start_iso>_<end_iso>"`, which is also the serialized
//! form used in catalog and rank documents.

pub mod algebra;

pub use algebra::{
    contains, gaps, is_sorted_disjoint, merge_adjacent, overlap, split_on_duplicates, trim,
};

use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Half-open UTC interval `[start, end)`.
///
/// Ordering is by start, then end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DateRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl DateRange {
    /// Create a range, rejecting zero-length and reversed intervals.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start.timestamp_nanos_opt().is_none() || end.timestamp_nanos_opt().is_none() {
            return Err(Error::InvalidRange(format!(
                "{} .. {} is outside the representable nanosecond span",
                start, end
            )));
        }
        if start == end {
            return Err(Error::InvalidRange(format!(
                "zero-length range at {}",
                format_instant(start)
            )));
        }
        if start > end {
            return Err(Error::InvalidRange(format!(
                "reversed range: start {} is after end {}",
                format_instant(start),
                format_instant(end)
            )));
        }
        Ok(Self { start, end })
    }

    /// Create a range from optional bounds; an open bound is rejected.
    pub fn from_bounds(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Result<Self> {
        match (start, end) {
            (Some(start), Some(end)) => Self::new(start, end),
            (None, _) => Err(Error::InvalidRange("unbounded start".to_string())),
            (_, None) => Err(Error::InvalidRange("unbounded end".to_string())),
        }
    }

    /// Create a range from nanoseconds since the Unix epoch.
    pub fn from_nanos(start: i64, end: i64) -> Result<Self> {
        Self::new(
            DateTime::from_timestamp_nanos(start),
            DateTime::from_timestamp_nanos(end),
        )
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Start as nanoseconds since the epoch.
    pub fn start_nanos(&self) -> i64 {
        // Checked at construction
        self.start.timestamp_nanos_opt().unwrap_or(i64::MIN)
    }

    /// End as nanoseconds since the epoch.
    pub fn end_nanos(&self) -> i64 {
        self.end.timestamp_nanos_opt().unwrap_or(i64::MAX)
    }

    /// Whether the instant (epoch nanos) falls inside `[start, end)`.
    pub fn contains_instant(&self, nanos: i64) -> bool {
        nanos >= self.start_nanos() && nanos < self.end_nanos()
    }

    /// Whether `other` lies entirely within this range.
    pub fn contains_range(&self, other: &DateRange) -> bool {
        contains(self, other)
    }

    /// Whether the two ranges share at least one instant.
    pub fn overlaps(&self, other: &DateRange) -> bool {
        overlap(self, other)
    }

    /// Whether the ranges touch end-to-start without overlapping.
    pub fn is_adjacent(&self, other: &DateRange) -> bool {
        self.end == other.start || other.end == self.start
    }

    /// Overlapping portion of the two ranges, if any.
    pub fn intersection(&self, other: &DateRange) -> Option<DateRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(DateRange { start, end })
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }
}

fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            Error::InvalidRange(format!(
                "'{}' is not a timezone-aware RFC 3339 timestamp: {}",
                raw, e
            ))
        })
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", format_instant(self.start), format_instant(self.end))
    }
}

impl FromStr for DateRange {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let Some((start, end)) = value.split_once('_') else {
            return Err(Error::InvalidRange(format!(
                "'{}' is not of the form <start>_<end>",
                value
            )));
        };
        if start.trim().is_empty() || end.trim().is_empty() {
            return Err(Error::InvalidRange(format!("'{}' has an open bound", value)));
        }
        Self::new(parse_instant(start)?, parse_instant(end)?)
    }
}

impl TryFrom<String> for DateRange {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DateRange> for String {
    fn from(range: DateRange) -> Self {
        range.to_string()
    }
}
