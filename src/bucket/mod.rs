//! Object store façade
//!
//! A [`Bucket`] is one named, independently permissioned store: one catalog
//! (Datasource records plus metadata index), one payload backend and one
//! set of ranking documents. Read-only buckets serve every read and reject
//! every mutation with [`Error::RequestBucket`]. Buckets never share state;
//! [`BucketRegistry`] only fans calls out to them.

pub mod registry;
mod retrieve;

pub use registry::BucketRegistry;
pub use retrieve::RetrievedData;

use crate::assign::{AssignOutcome, AssignRequest, AssignmentEngine};
use crate::backend::{payload, ArrayBackend, ParquetArrayBackend};
use crate::catalog::{BucketCatalog, CatalogConfig, CatalogStore};
use crate::datasource::Datasource;
use crate::daterange::DateRange;
use crate::lock::{LockConfig, LockManager, ObjectStoreLockManager};
use crate::metadata::{Filters, Metadata};
use crate::ranking::{self, GroupKey, Rank, RankEntry, RankStore, ResolvedSpan};
use crate::{Error, Result};

use arrow_array::RecordBatch;
use metrics::counter;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a user may do with a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "r")]
    Read,
    #[serde(rename = "rw")]
    ReadWrite,
}

impl Permission {
    pub fn is_writable(&self) -> bool {
        matches!(self, Permission::ReadWrite)
    }
}

impl FromStr for Permission {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "r" | "read" => Ok(Permission::Read),
            "rw" | "read-write" => Ok(Permission::ReadWrite),
            other => Err(Error::Config(format!(
                "permission must be 'r' or 'rw', got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Permission::Read => "r",
            Permission::ReadWrite => "rw",
        })
    }
}

/// Tuning shared by every bucket of a registry.
#[derive(Debug, Clone)]
pub struct BucketSettings {
    pub lock: LockConfig,
    pub cache_ttl: Duration,
}

impl Default for BucketSettings {
    fn default() -> Self {
        Self {
            lock: LockConfig::default(),
            cache_ttl: CatalogConfig::default().cache_ttl,
        }
    }
}

/// One search result, tagged with the bucket it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub bucket: String,
    pub uuid: Uuid,
    pub metadata: Metadata,
    /// First to last stored instant, `None` before any data
    pub span: Option<DateRange>,
}

/// Handle on one bucket.
pub struct Bucket {
    name: String,
    permission: Permission,
    catalog: Arc<CatalogStore>,
    backend: Arc<dyn ArrayBackend>,
    engine: AssignmentEngine,
    ranks: RankStore,
}

impl Bucket {
    /// Open the bucket rooted at `object_store`. Nothing is read until the
    /// first call.
    pub fn open(
        name: &str,
        permission: Permission,
        object_store: Arc<dyn ObjectStore>,
        settings: &BucketSettings,
    ) -> Self {
        let backend: Arc<dyn ArrayBackend> =
            Arc::new(ParquetArrayBackend::new(Arc::clone(&object_store), name));
        Self::with_backend(name, permission, object_store, backend, settings)
    }

    /// Open with a caller-supplied payload backend.
    pub fn with_backend(
        name: &str,
        permission: Permission,
        object_store: Arc<dyn ObjectStore>,
        backend: Arc<dyn ArrayBackend>,
        settings: &BucketSettings,
    ) -> Self {
        let locks: Arc<dyn LockManager> = Arc::new(ObjectStoreLockManager::new(
            Arc::clone(&object_store),
            settings.lock.clone(),
            name,
        ));
        let catalog = Arc::new(CatalogStore::new(
            Arc::clone(&object_store),
            Arc::clone(&locks),
            name,
            CatalogConfig {
                cache_ttl: settings.cache_ttl,
                lock_timeout: settings.lock.timeout,
            },
        ));
        let engine = AssignmentEngine::new(Arc::clone(&catalog), Arc::clone(&backend), name);
        let ranks = RankStore::new(object_store, locks, name, settings.lock.timeout);

        debug!(bucket = name, permission = %permission, "Opened bucket");
        Self {
            name: name.to_string(),
            permission,
            catalog,
            backend,
            engine,
            ranks,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    pub fn is_writable(&self) -> bool {
        self.permission.is_writable()
    }

    fn require_write(&self, operation: &str) -> Result<()> {
        if self.is_writable() {
            return Ok(());
        }
        counter!(
            "seriesvault_permission_denied_total",
            "service" => crate::telemetry::service(),
            "bucket" => self.name.clone()
        )
        .increment(1);
        Err(Error::RequestBucket(format!(
            "bucket '{}' is read-only; {} needs read-write permission",
            self.name, operation
        )))
    }

    fn lookup<'a>(&self, catalog: &'a BucketCatalog, uuid: &Uuid) -> Result<&'a Datasource> {
        catalog.get(uuid).ok_or_else(|| {
            Error::DatasourceLookup(format!("no datasource {} in bucket '{}'", uuid, self.name))
        })
    }

    /// Datasources matching `filters`.
    pub async fn search(&self, filters: &Filters) -> Result<Vec<SearchHit>> {
        let catalog = self.catalog.snapshot().await?;
        let hits: Vec<SearchHit> = catalog
            .search_datasources(filters)
            .into_iter()
            .map(|datasource| SearchHit {
                bucket: self.name.clone(),
                uuid: datasource.uuid(),
                metadata: datasource.metadata().clone(),
                span: datasource.span(),
            })
            .collect();
        debug!(bucket = %self.name, filters = filters.len(), hits = hits.len(), "Search");
        Ok(hits)
    }

    /// Store an upload; see [`AssignmentEngine::assign`].
    pub async fn assign(&self, request: AssignRequest) -> Result<AssignOutcome> {
        self.require_write("assign")?;
        self.engine.assign(request).await
    }

    pub async fn datasource(&self, uuid: &Uuid) -> Result<Datasource> {
        let catalog = self.catalog.snapshot().await?;
        self.lookup(&catalog, uuid).cloned()
    }

    pub async fn list_datasources(&self) -> Result<Vec<Datasource>> {
        let catalog = self.catalog.snapshot().await?;
        Ok(catalog.datasources().cloned().collect())
    }

    /// Merge `changes` into a Datasource's metadata; returns the result.
    pub async fn update_metadata(&self, uuid: &Uuid, changes: &Metadata) -> Result<Metadata> {
        self.require_write("update_metadata")?;
        let metadata = self
            .catalog
            .update("update_metadata", |catalog| {
                catalog.modify(uuid, |datasource| {
                    datasource.update_metadata(changes)?;
                    Ok(datasource.metadata().clone())
                })
            })
            .await?;
        info!(bucket = %self.name, datasource = %uuid, keys = changes.len(), "Updated metadata");
        Ok(metadata)
    }

    /// Remove a Datasource, its rank entries and its payloads.
    pub async fn delete_datasource(&self, uuid: &Uuid) -> Result<Datasource> {
        self.require_write("delete_datasource")?;
        let removed = self
            .catalog
            .update("delete_datasource", |catalog| {
                catalog.remove(uuid).ok_or_else(|| {
                    Error::DatasourceLookup(format!(
                        "no datasource {} in bucket '{}'",
                        uuid, self.name
                    ))
                })
            })
            .await?;

        // Leftover entries are ignored by resolution and pruned by set_rank
        match self.ranks.groups().await {
            Ok(groups) => {
                for group in groups {
                    match self
                        .ranks
                        .update(&group, |book| Ok(book.clear(*uuid, None)))
                        .await
                    {
                        Ok(true) => {
                            debug!(bucket = %self.name, datasource = %uuid, group = %group, "Cleared rank entries");
                        }
                        Ok(false) => {}
                        Err(e) => warn!(
                            bucket = %self.name,
                            datasource = %uuid,
                            group = %group,
                            error = %e,
                            "Failed to clear rank entries of deleted datasource"
                        ),
                    }
                }
            }
            Err(e) => warn!(
                bucket = %self.name,
                datasource = %uuid,
                error = %e,
                "Failed to list rank groups of deleted datasource"
            ),
        }

        for record in removed.versions() {
            if let Err(e) = self.backend.delete(&record.payload).await {
                warn!(
                    bucket = %self.name,
                    payload = %record.payload,
                    error = %e,
                    "Failed to remove payload of deleted datasource"
                );
            }
        }

        info!(bucket = %self.name, datasource = %uuid, "Deleted datasource");
        Ok(removed)
    }

    /// Windows of `bounds` without stored data.
    pub async fn data_gaps(&self, uuid: &Uuid, bounds: &DateRange) -> Result<Vec<DateRange>> {
        let catalog = self.catalog.snapshot().await?;
        Ok(self.lookup(&catalog, uuid)?.gaps(bounds))
    }

    /// Rebuild the metadata index from the Datasource records.
    pub async fn rebuild_index(&self) -> Result<usize> {
        self.require_write("rebuild_index")?;
        self.catalog.rebuild_index().await
    }

    /// Payload of one Datasource, restricted to `range` if given.
    ///
    /// `None` when nothing is stored in the window.
    pub async fn get_payload(
        &self,
        uuid: &Uuid,
        range: Option<&DateRange>,
    ) -> Result<Option<RecordBatch>> {
        let catalog = self.catalog.snapshot().await?;
        let datasource = self.lookup(&catalog, uuid)?;
        match self.read_window(datasource, range).await {
            // A cached snapshot may still point at a superseded object
            Err(Error::ObjectStore(object_store::Error::NotFound { .. })) => {
                debug!(bucket = %self.name, datasource = %uuid, "Stale catalog snapshot, refreshing");
                let catalog = self.catalog.refresh().await?;
                let datasource = self.lookup(&catalog, uuid)?;
                self.read_window(datasource, range).await
            }
            other => other,
        }
    }

    async fn read_window(
        &self,
        datasource: &Datasource,
        window: Option<&DateRange>,
    ) -> Result<Option<RecordBatch>> {
        let mut batches = Vec::new();
        for entry in datasource.history() {
            let slice = match window {
                Some(window) => match entry.range.intersection(window) {
                    Some(slice) => slice,
                    None => continue,
                },
                None => entry.range,
            };
            let record = datasource.version(entry.version).ok_or_else(|| {
                Error::Internal(format!(
                    "datasource {} has no record of version {}",
                    datasource.uuid(),
                    entry.version
                ))
            })?;
            let stored = self.backend.read(&record.payload).await?;
            let rows = payload::filter_range(&stored, &slice)?;
            if rows.num_rows() > 0 {
                batches.push(rows);
            }
        }
        payload::concat(&batches)
    }

    pub async fn get_ranks(&self, group: &GroupKey) -> Result<Vec<RankEntry>> {
        self.ranks.get_ranks(group).await
    }

    /// Every group with stored rank entries.
    pub async fn rank_groups(&self) -> Result<Vec<GroupKey>> {
        self.ranks.groups().await
    }

    /// Rank `uuid` within `group` over `range`.
    pub async fn set_rank(
        &self,
        group: &GroupKey,
        uuid: &Uuid,
        rank: Rank,
        range: DateRange,
    ) -> Result<()> {
        self.require_write("set_rank")?;
        if rank == 0 {
            return Err(Error::InvalidRank(rank));
        }

        // Entries read before the catalog whose Datasource is gone from it
        // belong to deleted Datasources
        let ranked = self.ranks.get_ranks(group).await?;
        let catalog = self.catalog.refresh().await?;
        let departed: BTreeSet<Uuid> = ranked
            .iter()
            .map(|entry| entry.datasource)
            .filter(|member| catalog.get(member).is_none())
            .collect();
        let datasource = self.lookup(&catalog, uuid)?;
        if !group.matches(datasource.metadata()) {
            return Err(Error::DatasourceLookup(format!(
                "datasource {} does not belong to group {}",
                uuid, group
            )));
        }

        self.ranks
            .update(group, |book| {
                let pruned = book.retain_datasources(|member| !departed.contains(member));
                if pruned > 0 {
                    debug!(bucket = %self.name, group = %group, pruned, "Pruned ranks of deleted datasources");
                }
                book.set(*uuid, rank, range)
            })
            .await?;
        counter!(
            "seriesvault_rank_updates_total",
            "service" => crate::telemetry::service(),
            "bucket" => self.name.clone()
        )
        .increment(1);
        info!(bucket = %self.name, group = %group, datasource = %uuid, rank, range = %range, "Set rank");
        Ok(())
    }

    /// Drop `uuid`'s rank entries in `group`, within `range` if given.
    pub async fn clear_rank(
        &self,
        group: &GroupKey,
        uuid: &Uuid,
        range: Option<&DateRange>,
    ) -> Result<bool> {
        self.require_write("clear_rank")?;
        let cleared = self
            .ranks
            .update(group, |book| Ok(book.clear(*uuid, range)))
            .await?;
        if cleared {
            info!(bucket = %self.name, group = %group, datasource = %uuid, "Cleared rank");
        }
        Ok(cleared)
    }

    /// Which Datasource of `group` supplies each part of `range`.
    pub async fn resolve_rank(
        &self,
        group: &GroupKey,
        range: &DateRange,
    ) -> Result<Vec<ResolvedSpan>> {
        let catalog = self.catalog.snapshot().await?;
        let members = catalog.search_datasources(&group.to_filters());
        let entries = self.ranks.get_ranks(group).await?;
        Ok(resolve_members(&members, &entries, range))
    }
}

/// Resolve among `members`, ignoring entries for Datasources outside them.
fn resolve_members(
    members: &[&Datasource],
    entries: &[RankEntry],
    range: &DateRange,
) -> Vec<ResolvedSpan> {
    let coverage: BTreeMap<Uuid, Vec<DateRange>> = members
        .iter()
        .map(|datasource| (datasource.uuid(), datasource.coverage()))
        .collect();
    let entries: Vec<RankEntry> = entries
        .iter()
        .filter(|entry| coverage.contains_key(&entry.datasource))
        .copied()
        .collect();
    ranking::resolve(&entries, &coverage, range)
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("name", &self.name)
            .field("permission", &self.permission)
            .finish()
    }
}
