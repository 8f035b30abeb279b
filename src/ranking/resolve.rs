//! Rank resolution over a requested window

use super::{Rank, RankEntry};
use crate::daterange::DateRange;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Who supplies the data for a span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    /// Lowest-ranked entry covering the span
    Ranked { datasource: Uuid, rank: Rank },
    /// No rank entry, but only one Datasource has data
    Fallback { datasource: Uuid },
    /// Several candidates and nothing to choose between them
    Unresolved { candidates: Vec<Uuid> },
    /// No Datasource has data
    NoData,
}

impl Resolution {
    /// Datasource supplying the span, if resolved.
    pub fn datasource(&self) -> Option<Uuid> {
        match self {
            Resolution::Ranked { datasource, .. } | Resolution::Fallback { datasource } => {
                Some(*datasource)
            }
            Resolution::Unresolved { .. } | Resolution::NoData => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSpan {
    pub range: DateRange,
    pub resolution: Resolution,
}

/// Partition `requested` by which Datasource should supply each part.
///
/// `coverage` maps every Datasource of the group to the ranges it holds
/// data for. The result covers `requested` exactly, in order, with
/// adjacent spans of equal resolution joined.
pub fn resolve(
    entries: &[RankEntry],
    coverage: &BTreeMap<Uuid, Vec<DateRange>>,
    requested: &DateRange,
) -> Vec<ResolvedSpan> {
    let mut cuts: BTreeSet<DateTime<Utc>> = BTreeSet::new();
    cuts.insert(requested.start());
    cuts.insert(requested.end());
    let inside = |t: DateTime<Utc>| t > requested.start() && t < requested.end();
    for entry in entries {
        cuts.extend([entry.range.start(), entry.range.end()].into_iter().filter(|t| inside(*t)));
    }
    for ranges in coverage.values() {
        for range in ranges {
            cuts.extend([range.start(), range.end()].into_iter().filter(|t| inside(*t)));
        }
    }

    let cuts: Vec<DateTime<Utc>> = cuts.into_iter().collect();
    let mut spans: Vec<ResolvedSpan> = Vec::with_capacity(cuts.len());

    for pair in cuts.windows(2) {
        let Ok(segment) = DateRange::new(pair[0], pair[1]) else {
            continue;
        };
        let resolution = resolve_segment(entries, coverage, &segment);

        match spans.last_mut() {
            Some(last) if last.resolution == resolution => {
                if let Ok(joined) = DateRange::new(last.range.start(), segment.end()) {
                    last.range = joined;
                }
            }
            _ => spans.push(ResolvedSpan {
                range: segment,
                resolution,
            }),
        }
    }
    spans
}

/// Segments never straddle an entry or coverage boundary, so overlap
/// implies containment here.
fn resolve_segment(
    entries: &[RankEntry],
    coverage: &BTreeMap<Uuid, Vec<DateRange>>,
    segment: &DateRange,
) -> Resolution {
    let covering: Vec<&RankEntry> = entries
        .iter()
        .filter(|entry| entry.range.overlaps(segment))
        .collect();

    if let Some(best) = covering.iter().map(|entry| entry.rank).min() {
        let winners: BTreeSet<Uuid> = covering
            .iter()
            .filter(|entry| entry.rank == best)
            .map(|entry| entry.datasource)
            .collect();
        let mut iter = winners.iter();
        return match (iter.next(), iter.next()) {
            (Some(only), None) => Resolution::Ranked {
                datasource: *only,
                rank: best,
            },
            _ => Resolution::Unresolved {
                candidates: winners.iter().copied().collect(),
            },
        };
    }

    let holders: Vec<Uuid> = coverage
        .iter()
        .filter(|(_, ranges)| ranges.iter().any(|range| range.overlaps(segment)))
        .map(|(uuid, _)| *uuid)
        .collect();
    match holders.as_slice() {
        [] => Resolution::NoData,
        [only] => Resolution::Fallback { datasource: *only },
        _ => Resolution::Unresolved {
            candidates: holders,
        },
    }
}
