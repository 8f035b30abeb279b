//! Interval algebra over [`DateRange`]
//!
//! All functions are pure. Touching ranges (`a.end == b.start`) are
//! adjacent, not overlapping: [`overlap`] reports `false` for them while
//! [`merge_adjacent`] coalesces them.

use super::DateRange;

/// True iff `a.start < b.end && b.start < a.end`.
pub fn overlap(a: &DateRange, b: &DateRange) -> bool {
    a.start() < b.end() && b.start() < a.end()
}

/// True iff `b` lies within `a`.
pub fn contains(a: &DateRange, b: &DateRange) -> bool {
    a.start() <= b.start() && b.end() <= a.end()
}

/// Sort and coalesce ranges that touch or overlap.
///
/// Ranges are non-empty by construction, so there is no failure path here;
/// empty input is rejected where a [`DateRange`] is built.
pub fn merge_adjacent<I>(ranges: I) -> Vec<DateRange>
where
    I: IntoIterator<Item = DateRange>,
{
    let mut sorted: Vec<DateRange> = ranges.into_iter().collect();
    sorted.sort();

    let mut merged: Vec<DateRange> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match merged.last_mut() {
            Some(last) if range.start() <= last.end() => {
                if range.end() > last.end() {
                    // start < range.end holds because last.start <= range.start
                    *last = DateRange {
                        start: last.start(),
                        end: range.end(),
                    };
                }
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Portions of `bounds` not covered by `ranges`.
///
/// `ranges` is expected sorted and disjoint; it is normalized with
/// [`merge_adjacent`] first so unsorted input still yields a correct answer.
pub fn gaps(ranges: &[DateRange], bounds: &DateRange) -> Vec<DateRange> {
    let mut result = Vec::new();
    let mut cursor = bounds.start();

    for range in merge_adjacent(ranges.iter().copied()) {
        if range.end() <= cursor {
            continue;
        }
        if range.start() >= bounds.end() {
            break;
        }
        if range.start() > cursor {
            result.push(DateRange {
                start: cursor,
                end: range.start(),
            });
        }
        cursor = cursor.max(range.end());
        if cursor >= bounds.end() {
            break;
        }
    }

    if cursor < bounds.end() {
        result.push(DateRange {
            start: cursor,
            end: bounds.end(),
        });
    }
    result
}

/// Sub-ranges of `a` left after removing the part overlapping `exclude`.
///
/// Returns zero (fully covered), one (clipped at one side, or untouched) or
/// two (hole punched in the middle) ranges, in ascending order.
pub fn trim(a: &DateRange, exclude: &DateRange) -> Vec<DateRange> {
    if !overlap(a, exclude) {
        return vec![*a];
    }

    let mut pieces = Vec::with_capacity(2);
    if a.start() < exclude.start() {
        pieces.push(DateRange {
            start: a.start(),
            end: exclude.start(),
        });
    }
    if exclude.end() < a.end() {
        pieces.push(DateRange {
            start: exclude.end(),
            end: a.end(),
        });
    }
    pieces
}

/// Indices of a timestamp sequence that repeat or go backwards.
///
/// Index `i` is flagged when `timestamps[i]` is not strictly greater than
/// every value before it. An empty result means the sequence is strictly
/// increasing and needs no deduplication.
pub fn split_on_duplicates(timestamps: &[i64]) -> Vec<usize> {
    let mut flagged = Vec::new();
    let mut high_water: Option<i64> = None;

    for (i, &ts) in timestamps.iter().enumerate() {
        match high_water {
            Some(max) if ts <= max => flagged.push(i),
            _ => high_water = Some(ts),
        }
    }
    flagged
}

/// Whether the ranges are sorted ascending and pairwise disjoint.
pub fn is_sorted_disjoint(ranges: &[DateRange]) -> bool {
    ranges
        .windows(2)
        .all(|pair| pair[0].end() <= pair[1].start())
}
