//! Versioned array backend
//!
//! The core stores and fetches payloads through [`ArrayBackend`] only. A
//! payload is addressed by a key (the Datasource it was written for) and a
//! version id; both are chosen by the caller and never reused, so a write
//! can happen without holding any lock.

pub mod parquet_store;
pub mod payload;

pub use parquet_store::ParquetArrayBackend;
pub use payload::{Discrepancy, DuplicatePolicy, SOURCE_COLUMN, TIME_COLUMN};

use crate::Result;
use arrow_array::RecordBatch;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of one stored payload version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadLocation {
    pub key: String,
    pub version: String,
}

impl PayloadLocation {
    pub fn new(key: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for PayloadLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.version)
    }
}

/// Narrow storage interface for payload versions of one bucket.
#[async_trait]
pub trait ArrayBackend: Send + Sync {
    /// Store a new version; returns the stored size in bytes.
    async fn write(&self, location: &PayloadLocation, payload: &RecordBatch) -> Result<u64>;

    async fn read(&self, location: &PayloadLocation) -> Result<RecordBatch>;

    /// Remove a version. Missing versions are not an error.
    async fn delete(&self, location: &PayloadLocation) -> Result<()>;
}
