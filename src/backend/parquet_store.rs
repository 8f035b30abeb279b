//! Parquet payloads on an object store

use super::{ArrayBackend, PayloadLocation};
use crate::{Error, Result};

use arrow::compute::concat_batches;
use arrow_array::RecordBatch;
use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use moka::future::Cache;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::{EnabledStatistics, WriterProperties, WriterVersion};
use std::sync::Arc;
use tracing::debug;

/// Default memory budget for decoded payloads, in bytes
pub const DEFAULT_CACHE_BYTES: u64 = 256 * 1024 * 1024;

/// Stores each payload version as one Parquet object under
/// `data/<key>/<version>.parquet`.
pub struct ParquetArrayBackend {
    object_store: Arc<dyn ObjectStore>,
    /// Decoded payloads weighed by their Arrow memory size; objects are
    /// immutable so entries never go stale
    cache: Cache<String, RecordBatch>,
    bucket: String,
}

impl ParquetArrayBackend {
    pub fn new(object_store: Arc<dyn ObjectStore>, bucket: &str) -> Self {
        Self::with_cache_capacity(object_store, bucket, DEFAULT_CACHE_BYTES)
    }

    /// Backend caching at most `capacity_bytes` of decoded payloads.
    pub fn with_cache_capacity(
        object_store: Arc<dyn ObjectStore>,
        bucket: &str,
        capacity_bytes: u64,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity_bytes)
            .weigher(|_key: &String, batch: &RecordBatch| {
                u32::try_from(batch.get_array_memory_size()).unwrap_or(u32::MAX)
            })
            .build();
        Self {
            object_store,
            cache,
            bucket: bucket.to_string(),
        }
    }

    fn writer_properties() -> Result<WriterProperties> {
        Ok(WriterProperties::builder()
            .set_writer_version(WriterVersion::PARQUET_2_0)
            .set_compression(Compression::ZSTD(ZstdLevel::try_new(3)?))
            .set_dictionary_enabled(true)
            // Page statistics on `time` let readers skip out-of-range pages
            .set_statistics_enabled(EnabledStatistics::Page)
            .set_max_row_group_size(500_000)
            .set_data_page_size_limit(1024 * 1024)
            .build())
    }

    fn object_path(location: &PayloadLocation) -> Path {
        Path::from_iter([
            "data",
            location.key.as_str(),
            &format!("{}.parquet", location.version),
        ])
    }

    fn encode(batch: &RecordBatch) -> Result<Bytes> {
        let mut buffer = Vec::new();
        {
            let mut writer =
                ArrowWriter::try_new(&mut buffer, batch.schema(), Some(Self::writer_properties()?))?;
            writer.write(batch)?;
            writer.close()?;
        }
        Ok(Bytes::from(buffer))
    }

    fn decode(data: Bytes) -> Result<RecordBatch> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(data)?;
        let schema = Arc::clone(builder.schema());
        let batches = builder
            .build()?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(concat_batches(&schema, &batches)?)
    }

    fn count(&self, operation: &'static str) {
        counter!(
            "seriesvault_payload_operations_total",
            "service" => crate::telemetry::service(),
            "bucket" => self.bucket.clone(),
            "operation" => operation
        )
        .increment(1);
    }
}

#[async_trait]
impl ArrayBackend for ParquetArrayBackend {
    async fn write(&self, location: &PayloadLocation, payload: &RecordBatch) -> Result<u64> {
        let path = Self::object_path(location);
        let bytes = Self::encode(payload)?;
        let size = bytes.len() as u64;

        // Versions are never overwritten
        let opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        match self
            .object_store
            .put_opts(&path, PutPayload::from(bytes), opts)
            .await
        {
            Ok(_) => {}
            Err(object_store::Error::AlreadyExists { .. }) => {
                return Err(Error::Internal(format!(
                    "payload version {} already exists",
                    path
                )))
            }
            Err(e) => return Err(Error::ObjectStore(e)),
        }

        self.count("write");
        debug!(path = %path, rows = payload.num_rows(), bytes = size, "Wrote payload");
        Ok(size)
    }

    async fn read(&self, location: &PayloadLocation) -> Result<RecordBatch> {
        let path = Self::object_path(location);
        let cache_key = path.to_string();
        if let Some(hit) = self.cache.get(&cache_key).await {
            self.count("cache_hit");
            return Ok(hit);
        }

        let data = self.object_store.get(&path).await?.bytes().await?;
        let batch = Self::decode(data)?;
        self.count("read");
        debug!(path = %path, rows = batch.num_rows(), "Read payload");
        self.cache.insert(cache_key, batch.clone()).await;
        Ok(batch)
    }

    async fn delete(&self, location: &PayloadLocation) -> Result<()> {
        let path = Self::object_path(location);
        self.cache.invalidate(&path.to_string()).await;
        match self.object_store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {
                self.count("delete");
                Ok(())
            }
            Err(e) => Err(Error::ObjectStore(e)),
        }
    }
}
