//! Date-range history merging
//!
//! A history is a sorted list of `(range, version)` entries with pairwise
//! disjoint ranges. Incoming data wins over stored data: every stored entry
//! overlapping the incoming range is trimmed, and the trimmed entries keep
//! pointing at their original version (the payload object is not rewritten).

use crate::daterange::{self, DateRange};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Monotonic per-Datasource version number.
pub type Version = u64;

/// One logical segment of a Datasource's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub range: DateRange,
    pub version: Version,
}

impl HistoryEntry {
    pub fn new(range: DateRange, version: Version) -> Self {
        Self { range, version }
    }
}

/// Stored entries whose ranges overlap `range`.
pub fn overlapping<'a>(
    history: &'a [HistoryEntry],
    range: &'a DateRange,
) -> impl Iterator<Item = &'a HistoryEntry> + 'a {
    history.iter().filter(move |entry| entry.range.overlaps(range))
}

/// Insert `incoming` into `history`, newest wins.
///
/// Touching entries are coalesced only when they reference the same
/// version; touching entries of different versions stay separate segments.
pub fn merge_history(history: &[HistoryEntry], incoming: HistoryEntry) -> Vec<HistoryEntry> {
    let mut merged: Vec<HistoryEntry> = Vec::with_capacity(history.len() + 2);

    for entry in history {
        merged.extend(
            daterange::trim(&entry.range, &incoming.range)
                .into_iter()
                .map(|range| HistoryEntry::new(range, entry.version)),
        );
    }
    merged.push(incoming);
    merged.sort_by(|a, b| a.range.cmp(&b.range));

    coalesce_same_version(merged)
}

fn coalesce_same_version(entries: Vec<HistoryEntry>) -> Vec<HistoryEntry> {
    let mut out: Vec<HistoryEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        match out.last_mut() {
            Some(last) if last.version == entry.version && last.range.end() == entry.range.start() => {
                if let Some(joined) = daterange::merge_adjacent([last.range, entry.range]).first() {
                    last.range = *joined;
                }
            }
            _ => out.push(entry),
        }
    }
    out
}

/// Check the sorted, pairwise-disjoint invariant.
pub fn validate_history(history: &[HistoryEntry]) -> Result<()> {
    for pair in history.windows(2) {
        if pair[0].range.end() > pair[1].range.start() {
            return Err(Error::Internal(format!(
                "history entries {} (v{}) and {} (v{}) are out of order or overlap",
                pair[0].range, pair[0].version, pair[1].range, pair[1].version
            )));
        }
    }
    Ok(())
}

/// Ranges of `history` only, for use with the range algebra.
pub fn ranges(history: &[HistoryEntry]) -> Vec<DateRange> {
    history.iter().map(|entry| entry.range).collect()
}

/// Whether the ranges of `history` satisfy the invariant.
pub fn is_valid(history: &[HistoryEntry]) -> bool {
    daterange::is_sorted_disjoint(&ranges(history))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: i64, end: i64) -> DateRange {
        DateRange::from_nanos(start, end).unwrap()
    }

    fn e(start: i64, end: i64, version: Version) -> HistoryEntry {
        HistoryEntry::new(r(start, end), version)
    }

    #[test]
    fn test_append_disjoint() {
        let history = vec![e(0, 10, 1)];
        let merged = merge_history(&history, e(20, 30, 2));
        assert_eq!(merged, vec![e(0, 10, 1), e(20, 30, 2)]);
    }

    #[test]
    fn test_touching_different_versions_stay_segmented() {
        let history = vec![e(0, 10, 1)];
        let merged = merge_history(&history, e(10, 20, 2));
        assert_eq!(merged, vec![e(0, 10, 1), e(10, 20, 2)]);
    }

    #[test]
    fn test_newest_wins_punches_hole() {
        let history = vec![e(0, 100, 1)];
        let merged = merge_history(&history, e(40, 60, 2));
        assert_eq!(merged, vec![e(0, 40, 1), e(40, 60, 2), e(60, 100, 1)]);
        assert!(is_valid(&merged));
    }

    #[test]
    fn test_newest_wins_spanning_several_entries() {
        let history = vec![e(0, 10, 1), e(10, 20, 2), e(30, 40, 3)];
        let merged = merge_history(&history, e(5, 35, 4));
        assert_eq!(merged, vec![e(0, 5, 1), e(5, 35, 4), e(35, 40, 3)]);
    }

    #[test]
    fn test_full_replacement_drops_entry() {
        let history = vec![e(0, 10, 1)];
        let merged = merge_history(&history, e(0, 10, 2));
        assert_eq!(merged, vec![e(0, 10, 2)]);
    }

    #[test]
    fn test_same_version_pieces_rejoin() {
        // Re-inserting the same version over its own hole restores one span
        let history = vec![e(0, 40, 1), e(60, 100, 1)];
        let merged = merge_history(&history, e(40, 60, 1));
        assert_eq!(merged, vec![e(0, 100, 1)]);
    }

    #[test]
    fn test_validate_rejects_overlap() {
        assert!(validate_history(&[e(0, 10, 1), e(20, 30, 2)]).is_ok());
        assert!(validate_history(&[e(0, 10, 1), e(5, 30, 2)]).is_err());
        assert!(validate_history(&[e(20, 30, 1), e(0, 10, 2)]).is_err());
    }

    #[test]
    fn test_overlapping_lists_only_clashes() {
        let history = vec![e(0, 10, 1), e(10, 20, 2), e(30, 40, 3)];
        let window = r(15, 35);
        let hits: Vec<Version> = overlapping(&history, &window).map(|e| e.version).collect();
        assert_eq!(hits, vec![2, 3]);
    }
}
