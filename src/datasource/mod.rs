//! Datasource records
//!
//! A Datasource is one logical series: a stable UUID, the metadata that
//! describes it, and a history mapping date ranges to stored payload
//! versions.

mod history;

pub use history::{is_valid, merge_history, overlapping, validate_history, HistoryEntry, Version};

use crate::backend::PayloadLocation;
use crate::daterange::{self, DateRange};
use crate::metadata::{DataKind, Fingerprint, Metadata, DATA_TYPE_KEY};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// How an incoming payload treats stored data it overlaps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Incoming data replaces stored data over the overlapping window
    #[default]
    NewestWins,
    /// Any overlap fails the assignment with `DataOverlap`
    Reject,
}

/// Where a version's payload lives and what it declared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: Version,
    /// Where the payload is stored in the bucket's array backend
    pub payload: PayloadLocation,
    /// Range declared by the upload
    pub range: DateRange,
    pub rows: usize,
    pub created_at: DateTime<Utc>,
}

/// Result of adding a version to a history.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionChange {
    pub version: Version,
    /// Versions no longer referenced by any history entry
    pub superseded: Vec<VersionRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datasource {
    uuid: Uuid,
    metadata: Metadata,
    kind: DataKind,
    fingerprint: String,
    history: Vec<HistoryEntry>,
    versions: BTreeMap<Version, VersionRecord>,
    latest_version: Option<Version>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Datasource {
    /// Create an empty Datasource; metadata must carry its identity keys.
    ///
    /// `data_type` is stored under its canonical kind name so that aliases
    /// (`emissions`, `footprints`) index the same way as the kind itself.
    pub fn new(uuid: Uuid, mut metadata: Metadata) -> Result<Self> {
        let fingerprint = Fingerprint::of(&metadata)?;
        metadata.insert(DATA_TYPE_KEY, fingerprint.kind().as_str());
        let now = Utc::now();
        Ok(Self {
            uuid,
            metadata,
            kind: fingerprint.kind(),
            fingerprint: fingerprint.to_string(),
            history: Vec::new(),
            versions: BTreeMap::new(),
            latest_version: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn kind(&self) -> DataKind {
        self.kind
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn versions(&self) -> impl Iterator<Item = &VersionRecord> {
        self.versions.values()
    }

    pub fn version(&self, version: Version) -> Option<&VersionRecord> {
        self.versions.get(&version)
    }

    pub fn latest_version(&self) -> Option<Version> {
        self.latest_version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn has_data(&self) -> bool {
        !self.history.is_empty()
    }

    /// Logically merged coverage of the history.
    pub fn coverage(&self) -> Vec<DateRange> {
        daterange::merge_adjacent(self.history.iter().map(|entry| entry.range))
    }

    /// Overall span from the first to the last stored instant.
    pub fn span(&self) -> Option<DateRange> {
        let first = self.history.first()?;
        let last = self.history.last()?;
        DateRange::new(first.range.start(), last.range.end()).ok()
    }

    /// Missing windows of `bounds`.
    pub fn gaps(&self, bounds: &DateRange) -> Vec<DateRange> {
        daterange::gaps(&self.coverage(), bounds)
    }

    /// Version that follows the latest one.
    pub fn next_version(&self) -> Version {
        self.latest_version.map_or(1, |v| v + 1)
    }

    /// Record a stored payload and merge its range into the history.
    ///
    /// On error the Datasource is left untouched.
    pub fn add_version(
        &mut self,
        payload: PayloadLocation,
        range: DateRange,
        rows: usize,
        policy: OverlapPolicy,
    ) -> Result<VersionChange> {
        if policy == OverlapPolicy::Reject {
            let clashes: Vec<String> = overlapping(&self.history, &range)
                .map(|entry| entry.range.to_string())
                .collect();
            if !clashes.is_empty() {
                return Err(Error::DataOverlap(format!(
                    "{} overlaps stored ranges {} of datasource {}",
                    range,
                    clashes.join(", "),
                    self.uuid
                )));
            }
        }

        let version = self.next_version();
        let history = merge_history(&self.history, HistoryEntry::new(range, version));
        validate_history(&history)?;

        let now = Utc::now();
        self.history = history;
        self.versions.insert(
            version,
            VersionRecord {
                version,
                payload,
                range,
                rows,
                created_at: now,
            },
        );
        self.latest_version = Some(version);
        self.updated_at = now;

        let referenced: std::collections::BTreeSet<Version> =
            self.history.iter().map(|entry| entry.version).collect();
        let stale: Vec<Version> = self
            .versions
            .keys()
            .filter(|v| !referenced.contains(v))
            .copied()
            .collect();
        let superseded = stale
            .into_iter()
            .filter_map(|v| self.versions.remove(&v))
            .collect();

        Ok(VersionChange {
            version,
            superseded,
        })
    }

    /// Merge `changes` into the metadata.
    ///
    /// Identity keys may not change once data is stored. Returns the
    /// metadata as it was before the update.
    pub fn update_metadata(&mut self, changes: &Metadata) -> Result<Metadata> {
        let mut updated = self.metadata.clone();
        updated.extend(changes);

        let fingerprint = Fingerprint::of(&updated)?;
        updated.insert(DATA_TYPE_KEY, fingerprint.kind().as_str());
        if self.has_data() && fingerprint.to_string() != self.fingerprint {
            let keys: Vec<&str> = changes
                .iter()
                .map(|(key, _)| key.as_str())
                .filter(|key| self.kind.is_identity_key(key) || fingerprint.kind().is_identity_key(key))
                .collect();
            return Err(Error::InvalidMetadata(format!(
                "identity keys [{}] of datasource {} cannot change once data is stored",
                keys.join(", "),
                self.uuid
            )));
        }

        let previous = std::mem::replace(&mut self.metadata, updated);
        self.kind = fingerprint.kind();
        self.fingerprint = fingerprint.to_string();
        self.updated_at = Utc::now();
        Ok(previous)
    }

    /// Check the stored history against the sorted, disjoint invariant.
    pub fn validate(&self) -> Result<()> {
        validate_history(&self.history)?;
        for entry in &self.history {
            if !self.versions.contains_key(&entry.version) {
                return Err(Error::Internal(format!(
                    "datasource {} history references unknown version {}",
                    self.uuid, entry.version
                )));
            }
        }
        Ok(())
    }
}
