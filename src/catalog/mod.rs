//! Bucket catalog: Datasource records and the metadata index
//!
//! Each bucket keeps a single JSON catalog at `index/catalog.json`. Readers
//! take an immutable snapshot (cached for a short TTL) and never wait for
//! writers. Writers take the bucket's `index` lock, load the current
//! document with its ETag, apply the mutation to a private copy, validate
//! it and swap the document in one conditional put. A failed mutation
//! leaves the stored catalog exactly as it was.

pub mod document;

use crate::backend::PayloadLocation;
use crate::datasource::Datasource;
use crate::lock::{LockGuard, LockManager};
use crate::metadata::{Filters, MetadataIndex};
use crate::{Error, Result};

use object_store::path::Path;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Current catalog document layout
pub const CATALOG_FORMAT_VERSION: u32 = 1;

/// Name of the bucket-wide index lock
pub const INDEX_LOCK: &str = "index";

/// Everything a bucket knows about its Datasources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketCatalog {
    pub format_version: u32,
    #[serde(default)]
    datasources: BTreeMap<Uuid, Datasource>,
    #[serde(default)]
    index: MetadataIndex,
}

impl Default for BucketCatalog {
    fn default() -> Self {
        Self {
            format_version: CATALOG_FORMAT_VERSION,
            datasources: BTreeMap::new(),
            index: MetadataIndex::new(),
        }
    }
}

impl BucketCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&Datasource> {
        self.datasources.get(uuid)
    }

    pub fn get_mut(&mut self, uuid: &Uuid) -> Option<&mut Datasource> {
        self.datasources.get_mut(uuid)
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.datasources.contains_key(uuid)
    }

    pub fn datasources(&self) -> impl Iterator<Item = &Datasource> {
        self.datasources.values()
    }

    pub fn len(&self) -> usize {
        self.datasources.len()
    }

    /// Whether any Datasource version is stored at `location`.
    pub fn references(&self, location: &PayloadLocation) -> bool {
        self.datasources
            .values()
            .any(|datasource| datasource.versions().any(|record| record.payload == *location))
    }

    pub fn is_empty(&self) -> bool {
        self.datasources.is_empty()
    }

    pub fn index(&self) -> &MetadataIndex {
        &self.index
    }

    /// UUIDs of Datasources matching `filters`, in UUID order.
    pub fn search(&self, filters: &Filters) -> Vec<Uuid> {
        self.index.search(filters).into_iter().collect()
    }

    /// Datasources matching `filters`.
    pub fn search_datasources(&self, filters: &Filters) -> Vec<&Datasource> {
        self.index
            .search(filters)
            .iter()
            .filter_map(|uuid| self.datasources.get(uuid))
            .collect()
    }

    /// Add a new Datasource and index it.
    pub fn insert(&mut self, datasource: Datasource) -> Result<()> {
        let uuid = datasource.uuid();
        if self.datasources.contains_key(&uuid) {
            return Err(Error::Internal(format!("datasource {} already exists", uuid)));
        }
        self.index.register(uuid, datasource.metadata());
        self.datasources.insert(uuid, datasource);
        Ok(())
    }

    /// Apply `f` to a stored Datasource and re-index it if its metadata changed.
    pub fn modify<T, F>(&mut self, uuid: &Uuid, f: F) -> Result<T>
    where
        F: FnOnce(&mut Datasource) -> Result<T>,
    {
        let datasource = self
            .datasources
            .get_mut(uuid)
            .ok_or_else(|| Error::DatasourceLookup(format!("no datasource {}", uuid)))?;
        let before = datasource.metadata().clone();
        let out = f(datasource)?;
        if datasource.metadata() != &before {
            self.index.update(*uuid, &before, datasource.metadata());
        }
        Ok(out)
    }

    /// Remove a Datasource and its index entries.
    pub fn remove(&mut self, uuid: &Uuid) -> Option<Datasource> {
        let datasource = self.datasources.remove(uuid)?;
        self.index.deregister(*uuid, datasource.metadata());
        Some(datasource)
    }

    /// Rebuild the inverted index from the stored records.
    pub fn rebuild_index(&mut self) {
        let mut index = MetadataIndex::new();
        for (uuid, datasource) in &self.datasources {
            index.register(*uuid, datasource.metadata());
        }
        self.index = index;
    }

    /// Check every Datasource history and the index membership.
    pub fn validate(&self) -> Result<()> {
        for datasource in self.datasources.values() {
            datasource.validate()?;
        }
        if self.index.len() != self.datasources.len()
            || self.datasources.keys().any(|uuid| !self.index.contains(uuid))
        {
            return Err(Error::Internal(
                "metadata index does not match the stored datasources".to_string(),
            ));
        }
        Ok(())
    }
}

/// Catalog settings
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    /// How long a snapshot may be served from memory
    pub cache_ttl: Duration,
    /// Maximum wait for the index lock
    pub lock_timeout: Duration,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(1),
            lock_timeout: Duration::from_secs(10),
        }
    }
}

/// Reads and swaps one bucket's catalog.
pub struct CatalogStore {
    object_store: Arc<dyn ObjectStore>,
    locks: Arc<dyn LockManager>,
    bucket: String,
    config: CatalogConfig,
    cache: RwLock<Option<(Arc<BucketCatalog>, Instant)>>,
}

impl CatalogStore {
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        locks: Arc<dyn LockManager>,
        bucket: &str,
        config: CatalogConfig,
    ) -> Self {
        Self {
            object_store,
            locks,
            bucket: bucket.to_string(),
            config,
            cache: RwLock::new(None),
        }
    }

    fn catalog_path() -> Path {
        Path::from_iter(["index", "catalog.json"])
    }

    pub fn lock_timeout(&self) -> Duration {
        self.config.lock_timeout
    }

    /// Consistent read-only view; may be up to `cache_ttl` old.
    pub async fn snapshot(&self) -> Result<Arc<BucketCatalog>> {
        {
            let cache = self.cache.read().await;
            if let Some((catalog, cached_at)) = cache.as_ref() {
                if cached_at.elapsed() < self.config.cache_ttl {
                    debug!(bucket = %self.bucket, "Catalog cache hit");
                    return Ok(Arc::clone(catalog));
                }
            }
        }

        debug!(bucket = %self.bucket, "Catalog cache miss");
        self.refresh().await
    }

    /// Load the stored catalog, bypassing the cache.
    pub async fn refresh(&self) -> Result<Arc<BucketCatalog>> {
        let (catalog, _etag) = self.load_with_etag().await?;
        let catalog = Arc::new(catalog);
        *self.cache.write().await = Some((Arc::clone(&catalog), Instant::now()));
        Ok(catalog)
    }

    /// Drop the cached snapshot.
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    async fn load_with_etag(&self) -> Result<(BucketCatalog, String)> {
        let path = Self::catalog_path();
        let (catalog, e_tag): (BucketCatalog, String) =
            document::load_document(self.object_store.as_ref(), &path).await?;
        if catalog.format_version > CATALOG_FORMAT_VERSION {
            return Err(Error::Serialization(format!(
                "catalog at {} has format version {}, newer than supported {}",
                path, catalog.format_version, CATALOG_FORMAT_VERSION
            )));
        }
        debug!(
            bucket = %self.bucket,
            datasources = catalog.len(),
            e_tag = %e_tag,
            "Loaded catalog"
        );
        Ok((catalog, e_tag))
    }

    /// Mutate the catalog under the bucket's index lock.
    ///
    /// `f` sees the latest stored catalog. Nothing is written when `f` or
    /// the post-mutation validation fails.
    pub async fn update<T, F>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut BucketCatalog) -> Result<T>,
    {
        let guard =
            LockGuard::acquire(Arc::clone(&self.locks), INDEX_LOCK, self.config.lock_timeout)
                .await?;

        let result = self.update_locked(operation, f).await;
        guard.release_or_expire().await;
        result
    }

    async fn update_locked<T, F>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut BucketCatalog) -> Result<T>,
    {
        let (mut catalog, e_tag) = self.load_with_etag().await?;
        let out = f(&mut catalog)?;
        catalog.format_version = CATALOG_FORMAT_VERSION;
        catalog.validate()?;

        document::store_document(
            self.object_store.as_ref(),
            &Self::catalog_path(),
            &catalog,
            &e_tag,
            &self.bucket,
            operation,
        )
        .await?;

        *self.cache.write().await = Some((Arc::new(catalog), Instant::now()));
        debug!(bucket = %self.bucket, operation, "Catalog swapped");
        Ok(out)
    }

    /// Rebuild the metadata index from the stored Datasource records.
    pub async fn rebuild_index(&self) -> Result<usize> {
        let count = self
            .update("rebuild_index", |catalog| {
                catalog.rebuild_index();
                Ok(catalog.len())
            })
            .await?;
        info!(bucket = %self.bucket, datasources = count, "Rebuilt metadata index");
        Ok(count)
    }
}
