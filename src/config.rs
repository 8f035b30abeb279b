//! User configuration and component factory
//!
//! A user's configuration names the buckets they can see, where each one
//! lives and whether they may write to it:
//!
//! ```toml
//! [object_store.user]
//! path = "/data/seriesvault/user"
//! permissions = "rw"
//!
//! [object_store.shared]
//! path = "/data/seriesvault/shared"
//! permissions = "r"
//!
//! [lock]
//! timeout_ms = 10000
//!
//! [catalog]
//! cache_ttl_ms = 1000
//! ```

use crate::bucket::{BucketSettings, Permission};
use crate::lock::LockConfig;
use crate::{Error, Result};

use object_store::{local::LocalFileSystem, memory::InMemory, ObjectStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "SERIESVAULT_CONFIG";

/// Bucket path selecting an in-process store
pub const MEMORY_PATH: &str = "memory";

/// One configured bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub path: String,
    #[serde(default = "default_permission")]
    pub permissions: Permission,
}

fn default_permission() -> Permission {
    Permission::Read
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSection {
    pub timeout_ms: u64,
    pub lease_ttl_secs: u64,
    pub max_skew_secs: u64,
}

impl Default for LockSection {
    fn default() -> Self {
        let defaults = LockConfig::default();
        Self {
            timeout_ms: defaults.timeout.as_millis() as u64,
            lease_ttl_secs: defaults.lease_ttl.as_secs(),
            max_skew_secs: defaults.max_skew.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSection {
    pub cache_ttl_ms: u64,
}

impl Default for CatalogSection {
    fn default() -> Self {
        Self { cache_ttl_ms: 1000 }
    }
}

/// Per-user configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub object_store: BTreeMap<String, BucketConfig>,
    #[serde(default)]
    pub lock: LockSection,
    #[serde(default)]
    pub catalog: CatalogSection,
}

impl UserConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: UserConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `explicit`, else `$SERIESVAULT_CONFIG`, else the user
    /// config directory.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = Self::locate(explicit)?;
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&raw)?;
        info!(
            path = %path.display(),
            buckets = config.object_store.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    fn locate(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.trim().is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
        dirs::config_dir()
            .map(|dir| dir.join("seriesvault").join("config.toml"))
            .ok_or_else(|| {
                Error::Config(format!(
                    "no config path given, {} unset and no user config directory",
                    CONFIG_ENV
                ))
            })
    }

    pub fn validate(&self) -> Result<()> {
        if self.object_store.is_empty() {
            return Err(Error::Config(
                "at least one [object_store.<name>] bucket must be configured".to_string(),
            ));
        }
        for (name, bucket) in &self.object_store {
            if name.trim().is_empty() {
                return Err(Error::Config("bucket names cannot be empty".to_string()));
            }
            if bucket.path.trim().is_empty() {
                return Err(Error::Config(format!("bucket '{}' has an empty path", name)));
            }
        }
        if self.lock.timeout_ms == 0 {
            return Err(Error::Config("lock.timeout_ms must be positive".to_string()));
        }
        if self.lock.lease_ttl_secs == 0 {
            return Err(Error::Config("lock.lease_ttl_secs must be positive".to_string()));
        }
        Ok(())
    }

    pub fn lock_config(&self) -> LockConfig {
        LockConfig {
            timeout: Duration::from_millis(self.lock.timeout_ms),
            lease_ttl: Duration::from_secs(self.lock.lease_ttl_secs),
            max_skew: Duration::from_secs(self.lock.max_skew_secs),
            ..LockConfig::default()
        }
    }

    pub fn bucket_settings(&self) -> BucketSettings {
        BucketSettings {
            lock: self.lock_config(),
            cache_ttl: Duration::from_millis(self.catalog.cache_ttl_ms),
        }
    }

    /// Names of the buckets this user may write to.
    pub fn writable_buckets(&self) -> Vec<&str> {
        self.object_store
            .iter()
            .filter(|(_, bucket)| bucket.permissions.is_writable())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// Object store backing `bucket`.
    ///
    /// `path = "memory"` gives a fresh in-process store; any other path is a
    /// local directory, created if missing.
    pub fn create_object_store(name: &str, bucket: &BucketConfig) -> Result<Arc<dyn ObjectStore>> {
        if bucket.path == MEMORY_PATH {
            info!(bucket = name, "Using in-memory object store");
            return Ok(Arc::new(InMemory::new()));
        }

        let root = PathBuf::from(&bucket.path);
        std::fs::create_dir_all(&root)?;
        info!(bucket = name, path = %root.display(), "Using local filesystem object store");
        Ok(Arc::new(LocalFileSystem::new_with_prefix(&root)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[object_store.user]
path = "memory"
permissions = "rw"

[object_store.shared]
path = "/data/shared"
permissions = "r"

[lock]
timeout_ms = 250
"#;

    #[test]
    fn test_parse_sample() {
        let config = UserConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.object_store.len(), 2);
        assert_eq!(config.object_store["shared"].permissions, Permission::Read);
        assert_eq!(config.writable_buckets(), vec!["user"]);
        assert_eq!(config.lock_config().timeout, Duration::from_millis(250));
        // Unset sections keep their defaults
        assert_eq!(config.lock.lease_ttl_secs, 300);
        assert_eq!(config.catalog.cache_ttl_ms, 1000);
    }

    #[test]
    fn test_validation() {
        assert!(matches!(UserConfig::from_toml(""), Err(Error::Config(_))));
        let zero_timeout = "[object_store.a]\npath = \"memory\"\n[lock]\ntimeout_ms = 0\n";
        assert!(matches!(UserConfig::from_toml(zero_timeout), Err(Error::Config(_))));
        let bad_permission = "[object_store.a]\npath = \"memory\"\npermissions = \"x\"\n";
        assert!(UserConfig::from_toml(bad_permission).is_err());
    }

    #[test]
    fn test_permission_defaults_to_read() {
        let config = UserConfig::from_toml("[object_store.a]\npath = \"memory\"\n").unwrap();
        assert_eq!(config.object_store["a"].permissions, Permission::Read);
        assert!(config.writable_buckets().is_empty());
    }

    #[test]
    fn test_explicit_path_wins() {
        let path = PathBuf::from("/tmp/explicit.toml");
        assert_eq!(UserConfig::locate(Some(&path)).unwrap(), path);
    }

    #[test]
    fn test_local_store_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested").join("bucket");
        let bucket = BucketConfig {
            path: root.to_string_lossy().to_string(),
            permissions: Permission::ReadWrite,
        };
        ComponentFactory::create_object_store("nested", &bucket).unwrap();
        assert!(root.is_dir());
    }
}
