//! Inverted metadata index
//!
//! Maps `key -> canonical value -> datasource ids`. Lists index every
//! element, so a Datasource tagged with several networks is found by any of
//! them.

use super::value::{Filters, Metadata};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataIndex {
    /// Every registered datasource, for unfiltered searches
    #[serde(default)]
    members: BTreeSet<Uuid>,
    /// key -> canonical value -> datasource ids
    #[serde(default)]
    terms: BTreeMap<String, BTreeMap<String, BTreeSet<Uuid>>>,
}

impl MetadataIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every term of `metadata` for `uuid`.
    pub fn register(&mut self, uuid: Uuid, metadata: &Metadata) {
        self.members.insert(uuid);
        for (key, value) in metadata.iter() {
            for term in value.canonical_terms() {
                self.terms
                    .entry(key.clone())
                    .or_default()
                    .entry(term)
                    .or_default()
                    .insert(uuid);
            }
        }
    }

    /// Remove every entry for `uuid` that `metadata` produced.
    pub fn deregister(&mut self, uuid: Uuid, metadata: &Metadata) {
        self.members.remove(&uuid);
        for (key, value) in metadata.iter() {
            let Some(values) = self.terms.get_mut(key) else {
                continue;
            };
            for term in value.canonical_terms() {
                if let Some(ids) = values.get_mut(&term) {
                    ids.remove(&uuid);
                    if ids.is_empty() {
                        values.remove(&term);
                    }
                }
            }
            if values.is_empty() {
                self.terms.remove(key);
            }
        }
    }

    /// Replace the entries of `uuid` built from `old` with ones from `new`.
    pub fn update(&mut self, uuid: Uuid, old: &Metadata, new: &Metadata) {
        self.deregister(uuid, old);
        self.register(uuid, new);
    }

    /// Datasources matching all filter keys (any listed value per key).
    pub fn search(&self, filters: &Filters) -> BTreeSet<Uuid> {
        let mut result: Option<BTreeSet<Uuid>> = None;

        for (key, criterion) in filters.iter() {
            let mut matched = BTreeSet::new();
            if let Some(values) = self.terms.get(key) {
                for term in criterion.terms() {
                    if let Some(ids) = values.get(&term) {
                        matched.extend(ids.iter().copied());
                    }
                }
            }

            result = Some(match result {
                None => matched,
                Some(acc) => acc.intersection(&matched).copied().collect(),
            });

            if result.as_ref().is_some_and(BTreeSet::is_empty) {
                break;
            }
        }

        result.unwrap_or_else(|| self.members.clone())
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.members.contains(uuid)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(site: &str, species: &str, inlet: &str) -> Metadata {
        Metadata::new()
            .with("site", site)
            .with("species", species)
            .with("inlet", inlet)
    }

    #[test]
    fn test_and_across_keys_or_within_key() {
        let mut index = MetadataIndex::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        index.register(a, &meta("tac", "ch4", "42m"));
        index.register(b, &meta("tac", "ch4", "100m"));
        index.register(c, &meta("mhd", "ch4", "10m"));

        let hits = index.search(&Filters::new().with("site", "TAC").with("species", "ch4"));
        assert_eq!(hits, BTreeSet::from([a, b]));

        let hits = index.search(
            &Filters::new()
                .with("species", "ch4")
                .with_any("inlet", vec!["42m", "10m"]),
        );
        assert_eq!(hits, BTreeSet::from([a, c]));

        assert!(index
            .search(&Filters::new().with("site", "tac").with("inlet", "10m"))
            .is_empty());
        assert_eq!(index.search(&Filters::new()).len(), 3);
    }

    #[test]
    fn test_unknown_key_matches_nothing() {
        let mut index = MetadataIndex::new();
        index.register(Uuid::new_v4(), &meta("tac", "ch4", "42m"));
        assert!(index.search(&Filters::new().with("model", "name")).is_empty());
    }

    #[test]
    fn test_deregister_removes_all_terms() {
        let mut index = MetadataIndex::new();
        let a = Uuid::new_v4();
        let metadata = meta("tac", "ch4", "42m").with("networks", vec!["decc", "icos"]);
        index.register(a, &metadata);
        assert_eq!(index.search(&Filters::new().with("networks", "icos")).len(), 1);

        index.deregister(a, &metadata);
        assert!(index.is_empty());
        assert_eq!(index, MetadataIndex::new());
    }

    #[test]
    fn test_update_moves_terms() {
        let mut index = MetadataIndex::new();
        let a = Uuid::new_v4();
        let old = meta("tac", "ch4", "42m");
        let new = old.clone().with("network", "decc");
        index.register(a, &old);
        index.update(a, &old, &new);
        assert_eq!(
            index.search(&Filters::new().with("network", "decc")),
            BTreeSet::from([a])
        );
    }
}
