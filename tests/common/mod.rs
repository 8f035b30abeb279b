//! Shared fixtures for integration tests

#![allow(dead_code)]

use arrow_array::{Array, Float64Array, RecordBatch, TimestampNanosecondArray};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::stream::BoxStream;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{
    GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore, PutMultipartOpts,
    PutOptions, PutPayload, PutResult,
};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use seriesvault::bucket::{Bucket, BucketSettings, Permission};
use seriesvault::daterange::DateRange;
use seriesvault::lock::LockConfig;
use seriesvault::metadata::Metadata;
use std::sync::Arc;
use std::time::Duration;

pub const HOUR_NS: i64 = 3_600_000_000_000;

pub fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

pub fn days(start: (i32, u32, u32), end: (i32, u32, u32)) -> DateRange {
    DateRange::new(day(start.0, start.1, start.2), day(end.0, end.1, end.2)).unwrap()
}

pub fn nanos(start: i64, end: i64) -> DateRange {
    DateRange::from_nanos(start, end).unwrap()
}

/// Surface measurement metadata at site TAC.
pub fn surface(inlet: &str) -> Metadata {
    Metadata::new()
        .with("data_type", "surface")
        .with("site", "tac")
        .with("species", "ch4")
        .with("inlet", inlet)
        .with("network", "decc")
}

/// Batch with a nanosecond UTC `time` column and a `value` column.
pub fn batch(times: &[i64], values: &[f64]) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new(
            "time",
            DataType::Timestamp(TimeUnit::Nanosecond, Some("UTC".into())),
            false,
        ),
        Field::new("value", DataType::Float64, true),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(TimestampNanosecondArray::from(times.to_vec()).with_timezone("UTC")),
            Arc::new(Float64Array::from(values.to_vec())),
        ],
    )
    .unwrap()
}

/// Hourly samples over `range`, each valued `value`.
pub fn hourly(range: &DateRange, value: f64) -> RecordBatch {
    let times: Vec<i64> = (range.start_nanos()..range.end_nanos())
        .step_by(HOUR_NS as usize)
        .collect();
    let values = vec![value; times.len()];
    batch(&times, &values)
}

pub fn values(batch: &RecordBatch) -> Vec<f64> {
    let column = batch
        .column_by_name("value")
        .unwrap()
        .as_any()
        .downcast_ref::<Float64Array>()
        .unwrap();
    (0..column.len()).map(|i| column.value(i)).collect()
}

pub fn times(batch: &RecordBatch) -> Vec<i64> {
    let column = batch
        .column_by_name("time")
        .unwrap()
        .as_any()
        .downcast_ref::<TimestampNanosecondArray>()
        .unwrap();
    (0..column.len()).map(|i| column.value(i)).collect()
}

pub fn settings(lock_timeout: Duration) -> BucketSettings {
    BucketSettings {
        lock: LockConfig {
            timeout: lock_timeout,
            ..LockConfig::default()
        },
        cache_ttl: Duration::from_millis(50),
    }
}

pub fn memory_store() -> Arc<dyn ObjectStore> {
    Arc::new(InMemory::new())
}

/// A writable bucket over `store`, as a separate process would open it.
pub fn open_bucket(store: &Arc<dyn ObjectStore>) -> Bucket {
    Bucket::open(
        "user",
        Permission::ReadWrite,
        Arc::clone(store),
        &settings(Duration::from_secs(10)),
    )
}

/// In-memory store whose reads under one prefix can be made to fail.
#[derive(Debug)]
pub struct FlakyStore {
    inner: InMemory,
    prefix: String,
    failing_reads: AtomicUsize,
}

impl FlakyStore {
    pub fn new(prefix: &str) -> Self {
        Self {
            inner: InMemory::new(),
            prefix: prefix.to_string(),
            failing_reads: AtomicUsize::new(0),
        }
    }

    /// Fail the next `count` reads under the prefix.
    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    fn take_failure(&self, location: &Path) -> bool {
        location.as_ref().starts_with(&self.prefix)
            && self
                .failing_reads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
    }
}

impl fmt::Display for FlakyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlakyStore({})", self.prefix)
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOpts,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(
        &self,
        location: &Path,
        options: GetOptions,
    ) -> object_store::Result<GetResult> {
        if self.take_failure(location) {
            return Err(object_store::Error::Generic {
                store: "FlakyStore",
                source: format!("injected read failure at {location}").into(),
            });
        }
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &Path) -> object_store::Result<()> {
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'static, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(&self, prefix: Option<&Path>) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}
