//! # seriesvault
//!
//! A versioned store for time series that arrive from many sources, in
//! overlapping pieces, with changing metadata.
//!
//! ## Key Features
//!
//! - **Identity by metadata**: uploads are matched to a Datasource by a
//!   fingerprint of their identity-defining metadata keys
//! - **Newest-wins history**: every Datasource keeps a sorted, disjoint list
//!   of `(range, version)` entries; new data trims what it overlaps
//! - **Ranked resolution**: competing Datasources of one group are ranked
//!   per date range, and retrieval stitches the winners together with
//!   per-row provenance
//! - **Buckets**: independently permissioned stores on a filesystem or in
//!   memory, safe for concurrent writers in separate processes
//!
//! ## Architecture
//!
//! - **Catalog**: Datasource records plus an inverted metadata index, swapped
//!   atomically under a bounded-wait lock
//! - **Backend**: immutable Parquet payload versions
//! - **Ranking**: per-group rank documents and a pure resolver

pub mod assign;
pub mod backend;
pub mod bucket;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod datasource;
pub mod daterange;
pub mod lock;
pub mod metadata;
pub mod ranking;
pub mod telemetry;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::assign::{AssignOutcome, AssignRequest};
    pub use crate::backend::DuplicatePolicy;
    pub use crate::bucket::{Bucket, BucketRegistry, BucketSettings, Permission, RetrievedData};
    pub use crate::config::UserConfig;
    pub use crate::datasource::{Datasource, OverlapPolicy, Version};
    pub use crate::daterange::DateRange;
    pub use crate::metadata::{Filters, Metadata};
    pub use crate::ranking::{GroupKey, Rank, Resolution, ResolvedSpan};
    pub use crate::{Error, Result};
}
