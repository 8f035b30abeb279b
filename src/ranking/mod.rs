//! Ranking of competing Datasources
//!
//! Within a group (for example one site and species measured at several
//! inlets) users rank Datasources per date range. Rank 1 is preferred. At
//! query time [`resolve`] partitions the requested window into spans, each
//! either won by a ranked Datasource, taken from the only Datasource with
//! data, or explicitly unresolved.

mod resolve;
mod store;

pub use resolve::{resolve, Resolution, ResolvedSpan};
pub use store::RankStore;

use crate::daterange::{self, DateRange};
use crate::metadata::{Filters, Metadata};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Preference order; 1 is most preferred.
pub type Rank = u32;

/// Exact metadata pairs naming a ranking group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(BTreeMap<String, String>);

impl GroupKey {
    /// Build from `(key, value)` pairs; values are canonicalized like metadata.
    pub fn new<K, V, I>(pairs: I) -> Result<Self>
    where
        K: AsRef<str>,
        V: AsRef<str>,
        I: IntoIterator<Item = (K, V)>,
    {
        let metadata: Metadata = pairs
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
            .collect();
        let pairs: BTreeMap<String, String> = metadata
            .iter()
            .filter_map(|(k, v)| v.canonical().map(|c| (k.clone(), c)))
            .collect();
        Self::checked(pairs)
    }

    /// Group named by single-valued filters.
    pub fn from_filters(filters: &Filters) -> Result<Self> {
        let pairs = filters.exact_pairs().ok_or_else(|| {
            Error::InvalidMetadata(
                "a ranking group needs exactly one value per key".to_string(),
            )
        })?;
        Self::checked(pairs)
    }

    fn checked(pairs: BTreeMap<String, String>) -> Result<Self> {
        if pairs.is_empty() {
            return Err(Error::InvalidMetadata(
                "a ranking group needs at least one key".to_string(),
            ));
        }
        if let Some((key, _)) = pairs.iter().find(|(k, v)| k.is_empty() || v.is_empty()) {
            return Err(Error::InvalidMetadata(format!(
                "ranking group has an empty key or value at '{}'",
                key
            )));
        }
        Ok(Self(pairs))
    }

    pub fn to_filters(&self) -> Filters {
        self.0
            .iter()
            .fold(Filters::new(), |filters, (k, v)| filters.with(k, v.as_str()))
    }

    /// Whether `metadata` belongs to this group.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.to_filters().matches(metadata)
    }

    pub fn pairs(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    /// Stable name for storage paths and lock names.
    pub fn slug(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{}-{}", sanitize(k), sanitize(v)))
            .collect::<Vec<_>>()
            .join("_")
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '~' })
        .collect()
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        f.write_str(&rendered.join(";"))
    }
}

/// One Datasource's rank over one date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankEntry {
    pub datasource: Uuid,
    pub rank: Rank,
    pub range: DateRange,
}

/// Rank entries of one group, as stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankBook {
    pub group: GroupKey,
    #[serde(default)]
    entries: Vec<RankEntry>,
}

impl RankBook {
    pub fn new(group: GroupKey) -> Self {
        Self {
            group,
            entries: Vec::new(),
        }
    }

    /// Entries ordered by range, then rank.
    pub fn entries(&self) -> &[RankEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rank `datasource` over `range`.
    ///
    /// Fails if another Datasource already holds the same rank over any
    /// part of `range`. Earlier entries of the same Datasource are trimmed
    /// where the new one covers them.
    pub fn set(&mut self, datasource: Uuid, rank: Rank, range: DateRange) -> Result<()> {
        if rank == 0 {
            return Err(Error::InvalidRank(rank));
        }

        if let Some(clash) = self
            .entries
            .iter()
            .find(|e| e.rank == rank && e.datasource != datasource && e.range.overlaps(&range))
        {
            return Err(Error::RankConflict(format!(
                "{} already holds rank {} over {} in group {}",
                clash.datasource, rank, clash.range, self.group
            )));
        }

        let mut entries = Vec::with_capacity(self.entries.len() + 2);
        for entry in &self.entries {
            if entry.datasource == datasource {
                entries.extend(daterange::trim(&entry.range, &range).into_iter().map(|piece| {
                    RankEntry {
                        range: piece,
                        ..*entry
                    }
                }));
            } else {
                entries.push(*entry);
            }
        }
        entries.push(RankEntry {
            datasource,
            rank,
            range,
        });

        self.entries = coalesce(entries);
        Ok(())
    }

    /// Drop `datasource`'s entries, within `range` if given; returns whether
    /// anything changed.
    pub fn clear(&mut self, datasource: Uuid, range: Option<&DateRange>) -> bool {
        let before = self.entries.clone();
        let mut entries = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            match (entry.datasource == datasource, range) {
                (false, _) => entries.push(*entry),
                (true, None) => {}
                (true, Some(window)) => {
                    entries.extend(daterange::trim(&entry.range, window).into_iter().map(
                        |piece| RankEntry {
                            range: piece,
                            ..*entry
                        },
                    ));
                }
            }
        }
        self.entries = coalesce(entries);
        self.entries != before
    }

    /// Drop entries whose Datasource fails `keep`; returns how many went.
    pub fn retain_datasources(&mut self, keep: impl Fn(&Uuid) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| keep(&entry.datasource));
        before - self.entries.len()
    }
}

/// Join touching entries of the same Datasource and rank, then sort.
fn coalesce(entries: Vec<RankEntry>) -> Vec<RankEntry> {
    let mut by_owner: BTreeMap<(Uuid, Rank), Vec<DateRange>> = BTreeMap::new();
    for entry in entries {
        by_owner
            .entry((entry.datasource, entry.rank))
            .or_default()
            .push(entry.range);
    }

    let mut out: Vec<RankEntry> = by_owner
        .into_iter()
        .flat_map(|((datasource, rank), ranges)| {
            daterange::merge_adjacent(ranges)
                .into_iter()
                .map(move |range| RankEntry {
                    datasource,
                    rank,
                    range,
                })
        })
        .collect();
    out.sort_by(|a, b| a.range.cmp(&b.range).then(a.rank.cmp(&b.rank)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: i64, end: i64) -> DateRange {
        DateRange::from_nanos(start, end).unwrap()
    }

    fn group() -> GroupKey {
        GroupKey::new([("site", "TAC"), ("species", "ch4")]).unwrap()
    }

    #[test]
    fn test_group_key_canonical() {
        let key = group();
        assert_eq!(key.to_string(), "site=tac;species=ch4");
        assert_eq!(key.slug(), "site-tac_species-ch4");
        let from_filters =
            GroupKey::from_filters(&Filters::new().with("Species", "CH4").with("site", "tac"))
                .unwrap();
        assert_eq!(from_filters, key);

        assert!(GroupKey::from_filters(&Filters::new()).is_err());
        assert!(
            GroupKey::from_filters(&Filters::new().with_any("site", vec!["a", "b"])).is_err()
        );
    }

    #[test]
    fn test_rank_zero_rejected() {
        let mut book = RankBook::new(group());
        assert!(matches!(
            book.set(Uuid::new_v4(), 0, r(0, 10)),
            Err(Error::InvalidRank(0))
        ));
    }

    #[test]
    fn test_same_rank_overlap_conflicts() {
        let mut book = RankBook::new(group());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        book.set(a, 1, r(0, 10)).unwrap();
        assert!(matches!(book.set(b, 1, r(5, 15)), Err(Error::RankConflict(_))));
        // Touching is fine, and so is a different rank
        book.set(b, 1, r(10, 20)).unwrap();
        book.set(b, 2, r(0, 10)).unwrap();
        assert_eq!(book.entries().len(), 3);
    }

    #[test]
    fn test_same_datasource_overrides_itself() {
        let mut book = RankBook::new(group());
        let a = Uuid::new_v4();
        book.set(a, 2, r(0, 100)).unwrap();
        book.set(a, 1, r(40, 60)).unwrap();
        let entries: Vec<(Rank, DateRange)> =
            book.entries().iter().map(|e| (e.rank, e.range)).collect();
        assert_eq!(
            entries,
            vec![(2, r(0, 40)), (1, r(40, 60)), (2, r(60, 100))]
        );
    }

    #[test]
    fn test_touching_entries_coalesce() {
        let mut book = RankBook::new(group());
        let a = Uuid::new_v4();
        book.set(a, 1, r(0, 10)).unwrap();
        book.set(a, 1, r(10, 20)).unwrap();
        assert_eq!(book.entries().len(), 1);
        assert_eq!(book.entries()[0].range, r(0, 20));
    }

    #[test]
    fn test_clear() {
        let mut book = RankBook::new(group());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        book.set(a, 1, r(0, 100)).unwrap();
        book.set(b, 2, r(0, 100)).unwrap();

        assert!(book.clear(a, Some(&r(20, 30))));
        assert_eq!(
            book.entries()
                .iter()
                .filter(|e| e.datasource == a)
                .map(|e| e.range)
                .collect::<Vec<_>>(),
            vec![r(0, 20), r(30, 100)]
        );

        assert!(book.clear(a, None));
        assert!(!book.clear(a, None));
        assert_eq!(book.entries().len(), 1);
    }

    #[test]
    fn test_retain_drops_departed_datasources() {
        let mut book = RankBook::new(group());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        book.set(a, 1, r(0, 100)).unwrap();
        book.set(b, 2, r(0, 100)).unwrap();

        assert_eq!(book.retain_datasources(|uuid| *uuid == b), 1);
        // Rank 1 is free again once its holder is gone
        book.set(b, 1, r(50, 60)).unwrap();
        assert!(book.entries().iter().all(|e| e.datasource == b));
    }
}
