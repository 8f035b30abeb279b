//! Error types for seriesvault

use std::fmt;
use std::time::Duration;

/// Result type alias for seriesvault operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for seriesvault
#[derive(Debug)]
pub enum Error {
    /// Malformed, empty, reversed or unbounded date range
    InvalidRange(String),
    /// Identity match was ambiguous or missing
    DatasourceLookup(String),
    /// Backend or catalog storage failure
    ObjectStore(object_store::Error),
    /// Lock could not be acquired within the configured timeout
    MutexTimeout { lock: String, waited: Duration },
    /// Bucket unknown or not permitted for the requested operation
    RequestBucket(String),
    /// Payload without a usable time column, or empty
    InvalidPayload(String),
    /// Metadata missing identity keys or illegal metadata change
    InvalidMetadata(String),
    /// Rank values start at 1
    InvalidRank(u32),
    /// Two Datasources claim the same rank over overlapping dates
    RankConflict(String),
    /// Incoming data overlaps stored history under `OverlapPolicy::Reject`
    DataOverlap(String),
    /// Document changed underneath a locked update (compare-and-swap failure)
    Conflict,
    /// Arrow-related errors
    Arrow(arrow::error::ArrowError),
    /// Parquet-related errors
    Parquet(parquet::errors::ParquetError),
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// Internal error
    Internal(String),
}

impl Error {
    /// Whether the caller may retry the same call unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ObjectStore(_) | Error::MutexTimeout { .. } | Error::Conflict
        )
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ObjectStore(e) => Some(e),
            Error::Arrow(e) => Some(e),
            Error::Parquet(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidRange(msg) => write!(f, "Invalid date range: {}", msg),
            Error::DatasourceLookup(msg) => write!(f, "Datasource lookup failed: {}", msg),
            Error::ObjectStore(e) => write!(f, "Object store error: {}", e),
            Error::MutexTimeout { lock, waited } => write!(
                f,
                "Timed out after {}ms waiting for lock '{}'",
                waited.as_millis(),
                lock
            ),
            Error::RequestBucket(msg) => write!(f, "Bucket request rejected: {}", msg),
            Error::InvalidPayload(msg) => write!(f, "Invalid payload: {}", msg),
            Error::InvalidMetadata(msg) => write!(f, "Invalid metadata: {}", msg),
            Error::InvalidRank(rank) => write!(f, "Invalid rank {}: ranks start at 1", rank),
            Error::RankConflict(msg) => write!(f, "Rank conflict: {}", msg),
            Error::DataOverlap(msg) => write!(f, "Data overlaps stored history: {}", msg),
            Error::Conflict => write!(f, "Metadata conflict: concurrent modification detected"),
            Error::Arrow(e) => write!(f, "Arrow error: {}", e),
            Error::Parquet(e) => write!(f, "Parquet error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        Error::ObjectStore(e)
    }
}

impl From<arrow::error::ArrowError> for Error {
    fn from(e: arrow::error::ArrowError) -> Self {
        Error::Arrow(e)
    }
}

impl From<parquet::errors::ParquetError> for Error {
    fn from(e: parquet::errors::ParquetError) -> Self {
        Error::Parquet(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
