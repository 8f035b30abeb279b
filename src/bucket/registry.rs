//! Named buckets available to one user

use super::{Bucket, BucketSettings, SearchHit};
use crate::config::{ComponentFactory, UserConfig};
use crate::metadata::Filters;
use crate::{Error, Result};

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Explicit set of open buckets, passed to whatever needs store access.
#[derive(Debug, Default)]
pub struct BucketRegistry {
    buckets: BTreeMap<String, Arc<Bucket>>,
}

impl BucketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open every bucket named in `config`.
    pub fn from_config(config: &UserConfig) -> Result<Self> {
        let registry = Self::with_settings(config, &config.bucket_settings())?;
        info!(
            buckets = registry.buckets.len(),
            writable = config.writable_buckets().len(),
            "Opened buckets"
        );
        Ok(registry)
    }

    /// Open every bucket named in `config` with explicit settings.
    pub fn with_settings(config: &UserConfig, settings: &BucketSettings) -> Result<Self> {
        config.validate()?;
        let mut registry = Self::new();
        for (name, bucket) in &config.object_store {
            let object_store = ComponentFactory::create_object_store(name, bucket)?;
            registry.add(Bucket::open(name, bucket.permissions, object_store, settings))?;
        }
        Ok(registry)
    }

    pub fn add(&mut self, bucket: Bucket) -> Result<Arc<Bucket>> {
        let name = bucket.name().to_string();
        if self.buckets.contains_key(&name) {
            return Err(Error::Config(format!("bucket '{}' is already registered", name)));
        }
        let bucket = Arc::new(bucket);
        self.buckets.insert(name, Arc::clone(&bucket));
        Ok(bucket)
    }

    pub fn get_bucket(&self, name: &str) -> Result<Arc<Bucket>> {
        self.buckets.get(name).cloned().ok_or_else(|| {
            Error::RequestBucket(format!(
                "unknown bucket '{}'; configured buckets: [{}]",
                name,
                self.names().join(", ")
            ))
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.buckets.keys().map(String::as_str).collect()
    }

    pub fn buckets(&self) -> impl Iterator<Item = &Arc<Bucket>> {
        self.buckets.values()
    }

    /// Bucket to write to: the named one, or the only read-write bucket.
    pub fn write_bucket(&self, name: Option<&str>) -> Result<Arc<Bucket>> {
        if let Some(name) = name {
            let bucket = self.get_bucket(name)?;
            if !bucket.is_writable() {
                return Err(Error::RequestBucket(format!(
                    "bucket '{}' is read-only",
                    name
                )));
            }
            return Ok(bucket);
        }

        let writable: Vec<&Arc<Bucket>> =
            self.buckets.values().filter(|b| b.is_writable()).collect();
        match writable.as_slice() {
            [] => Err(Error::RequestBucket(
                "no read-write bucket is configured".to_string(),
            )),
            [only] => Ok(Arc::clone(only)),
            several => Err(Error::RequestBucket(format!(
                "{} read-write buckets are configured ({}); name one",
                several.len(),
                several
                    .iter()
                    .map(|b| b.name())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    /// Search every bucket; hits keep the bucket they came from.
    pub async fn search(&self, filters: &Filters) -> Result<Vec<SearchHit>> {
        let mut hits = Vec::new();
        for bucket in self.buckets.values() {
            hits.extend(bucket.search(filters).await?);
        }
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::Permission;
    use object_store::memory::InMemory;

    fn bucket(name: &str, permission: Permission) -> Bucket {
        Bucket::open(
            name,
            permission,
            Arc::new(InMemory::new()),
            &BucketSettings::default(),
        )
    }

    #[test]
    fn test_write_bucket_selection() {
        let mut registry = BucketRegistry::new();
        assert!(matches!(registry.write_bucket(None), Err(Error::RequestBucket(_))));

        registry.add(bucket("shared", Permission::Read)).unwrap();
        registry.add(bucket("user", Permission::ReadWrite)).unwrap();
        assert_eq!(registry.write_bucket(None).unwrap().name(), "user");
        assert!(matches!(
            registry.write_bucket(Some("shared")),
            Err(Error::RequestBucket(_))
        ));

        registry.add(bucket("group", Permission::ReadWrite)).unwrap();
        assert!(matches!(registry.write_bucket(None), Err(Error::RequestBucket(_))));
        assert_eq!(registry.write_bucket(Some("group")).unwrap().name(), "group");
    }

    #[test]
    fn test_unknown_and_duplicate_buckets() {
        let mut registry = BucketRegistry::new();
        registry.add(bucket("user", Permission::ReadWrite)).unwrap();
        assert!(matches!(registry.add(bucket("user", Permission::Read)), Err(Error::Config(_))));
        assert!(matches!(registry.get_bucket("nope"), Err(Error::RequestBucket(_))));
        assert_eq!(registry.names(), vec!["user"]);
    }

    #[test]
    fn test_from_config() {
        let config = UserConfig::from_toml(
            "[object_store.a]\npath = \"memory\"\npermissions = \"rw\"\n\
             [object_store.b]\npath = \"memory\"\n",
        )
        .unwrap();
        let registry = BucketRegistry::from_config(&config).unwrap();
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.get_bucket("a").unwrap().is_writable());
        assert!(!registry.get_bucket("b").unwrap().is_writable());
    }
}
