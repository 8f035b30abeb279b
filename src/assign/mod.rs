//! Assignment of incoming payloads to Datasources
//!
//! An upload is matched to a Datasource by metadata fingerprint, created if
//! no Datasource carries it, and merged into that Datasource's history
//! newest-wins. The payload object is written before the bucket lock is
//! taken; the lock only covers the catalog swap. If the swap fails the
//! payload object is removed again, so a failed assignment leaves nothing
//! visible behind.

use crate::backend::{payload, ArrayBackend, Discrepancy, DuplicatePolicy, PayloadLocation};
use crate::catalog::{BucketCatalog, CatalogStore};
use crate::daterange::DateRange;
use crate::datasource::{Datasource, OverlapPolicy, Version, VersionChange};
use crate::metadata::{Fingerprint, Metadata};
use crate::{Error, Result};

use arrow_array::RecordBatch;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// One upload to assign.
#[derive(Debug, Clone)]
pub struct AssignRequest {
    pub metadata: Metadata,
    pub payload: RecordBatch,
    /// Declared range; every payload timestamp must fall inside it
    pub range: DateRange,
    /// Datasource to extend when the fingerprint matches several
    pub target: Option<Uuid>,
    pub overlap: OverlapPolicy,
    pub duplicates: DuplicatePolicy,
}

impl AssignRequest {
    pub fn new(metadata: Metadata, payload: RecordBatch, range: DateRange) -> Self {
        Self {
            metadata,
            payload,
            range,
            target: None,
            overlap: OverlapPolicy::default(),
            duplicates: DuplicatePolicy::default(),
        }
    }

    pub fn with_target(mut self, target: Uuid) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_overlap_policy(mut self, overlap: OverlapPolicy) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn with_duplicate_policy(mut self, duplicates: DuplicatePolicy) -> Self {
        self.duplicates = duplicates;
        self
    }
}

/// What an assignment did.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignOutcome {
    pub uuid: Uuid,
    pub version: Version,
    /// A new Datasource was created
    pub created: bool,
    /// Rows stored after deduplication
    pub rows: usize,
    pub discrepancy: Option<Discrepancy>,
    /// Earlier versions fully replaced by this one
    pub superseded: Vec<Version>,
}

/// Datasources in `catalog` carrying exactly `fingerprint`.
pub fn find_by_fingerprint(catalog: &BucketCatalog, fingerprint: &Fingerprint) -> Vec<Uuid> {
    let rendered = fingerprint.to_string();
    catalog
        .search_datasources(&fingerprint.to_filters())
        .into_iter()
        .filter(|datasource| datasource.fingerprint() == rendered)
        .map(Datasource::uuid)
        .collect()
}

/// Pick the Datasource an upload belongs to, `None` to create one.
fn select_datasource(
    catalog: &BucketCatalog,
    fingerprint: &Fingerprint,
    target: Option<Uuid>,
) -> Result<Option<Uuid>> {
    let matches = find_by_fingerprint(catalog, fingerprint);

    if let Some(target) = target {
        if matches.contains(&target) {
            return Ok(Some(target));
        }
        return Err(Error::DatasourceLookup(if catalog.contains(&target) {
            format!(
                "datasource {} does not carry fingerprint {}",
                target, fingerprint
            )
        } else {
            format!("no datasource {}", target)
        }));
    }

    match matches.as_slice() {
        [] => Ok(None),
        [only] => Ok(Some(*only)),
        several => Err(Error::DatasourceLookup(format!(
            "fingerprint {} matches {} datasources ({}); name the target datasource",
            fingerprint,
            several.len(),
            several
                .iter()
                .map(Uuid::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

/// Assigns uploads within one bucket.
pub struct AssignmentEngine {
    catalog: Arc<CatalogStore>,
    backend: Arc<dyn ArrayBackend>,
    bucket: String,
}

impl AssignmentEngine {
    pub fn new(catalog: Arc<CatalogStore>, backend: Arc<dyn ArrayBackend>, bucket: &str) -> Self {
        Self {
            catalog,
            backend,
            bucket: bucket.to_string(),
        }
    }

    /// Store `request.payload` and merge it into the matching Datasource.
    pub async fn assign(&self, request: AssignRequest) -> Result<AssignOutcome> {
        let started = Instant::now();
        let result = self.assign_inner(request).await;

        let label = match &result {
            Ok(outcome) if outcome.created => "created",
            Ok(_) => "extended",
            Err(_) => "error",
        };
        counter!(
            "seriesvault_assignments_total",
            "service" => crate::telemetry::service(),
            "bucket" => self.bucket.clone(),
            "result" => label
        )
        .increment(1);
        histogram!(
            "seriesvault_assignment_duration_seconds",
            "service" => crate::telemetry::service(),
            "bucket" => self.bucket.clone()
        )
        .record(started.elapsed().as_secs_f64());
        result
    }

    /// Remove the payload of a failed assignment unless the stored catalog
    /// references it.
    ///
    /// A swap can report failure after it committed (an ambiguous store
    /// response), so the catalog is re-read first; when that read fails too
    /// the object is kept.
    async fn discard_unreferenced(&self, location: &PayloadLocation) {
        match self.catalog.refresh().await {
            Ok(catalog) if catalog.references(location) => {
                warn!(
                    bucket = %self.bucket,
                    payload = %location,
                    "Assignment reported failure but its version is committed; keeping payload"
                );
            }
            Ok(_) => {
                if let Err(e) = self.backend.delete(location).await {
                    warn!(
                        bucket = %self.bucket,
                        payload = %location,
                        error = %e,
                        "Failed to remove payload of failed assignment"
                    );
                }
            }
            Err(e) => {
                warn!(
                    bucket = %self.bucket,
                    payload = %location,
                    error = %e,
                    "Could not confirm failed assignment; leaving payload in place"
                );
            }
        }
    }

    async fn assign_inner(&self, request: AssignRequest) -> Result<AssignOutcome> {
        let AssignRequest {
            metadata,
            payload: raw,
            range,
            target,
            overlap,
            duplicates,
        } = request;

        let fingerprint = Fingerprint::of(&metadata)?;
        let (normalized, discrepancy) = payload::normalize(&raw, duplicates)?;
        if normalized.num_rows() == 0 {
            return Err(Error::InvalidPayload("payload has no rows".to_string()));
        }
        payload::check_within(&payload::time_nanos(&normalized)?, &range)?;

        if let Some(report) = &discrepancy {
            warn!(
                bucket = %self.bucket,
                fingerprint = %fingerprint,
                duplicates_removed = report.duplicates_removed,
                out_of_order = report.out_of_order,
                policy = ?report.policy,
                "Normalized payload with repeated or unsorted timestamps"
            );
            counter!(
                "seriesvault_discrepancies_total",
                "service" => crate::telemetry::service(),
                "bucket" => self.bucket.clone()
            )
            .increment(1);
        }

        // Payload objects are keyed by a candidate Datasource id so related
        // versions sit together; the catalog records the exact location.
        let snapshot = self.catalog.snapshot().await?;
        let candidate = match select_datasource(&snapshot, &fingerprint, target) {
            Ok(Some(uuid)) => uuid,
            _ => target.unwrap_or_else(Uuid::new_v4),
        };
        let location = PayloadLocation::new(candidate.to_string(), Uuid::new_v4().to_string());
        let rows = normalized.num_rows();
        self.backend.write(&location, &normalized).await?;

        let swap = self
            .catalog
            .update("assign", |catalog| {
                let (uuid, created) = match select_datasource(catalog, &fingerprint, target)? {
                    Some(uuid) => (uuid, false),
                    None => {
                        let uuid = if catalog.contains(&candidate) {
                            Uuid::new_v4()
                        } else {
                            candidate
                        };
                        catalog.insert(Datasource::new(uuid, metadata.clone())?)?;
                        (uuid, true)
                    }
                };
                let change = catalog.modify(&uuid, |datasource| {
                    if !created {
                        datasource.update_metadata(&metadata)?;
                    }
                    datasource.add_version(location.clone(), range, rows, overlap)
                })?;
                Ok((uuid, created, change))
            })
            .await;

        let (uuid, created, change): (Uuid, bool, VersionChange) = match swap {
            Ok(done) => done,
            Err(e) => {
                self.discard_unreferenced(&location).await;
                return Err(e);
            }
        };

        for record in &change.superseded {
            if let Err(e) = self.backend.delete(&record.payload).await {
                warn!(
                    bucket = %self.bucket,
                    payload = %record.payload,
                    error = %e,
                    "Failed to remove superseded payload"
                );
            }
        }

        info!(
            bucket = %self.bucket,
            datasource = %uuid,
            version = change.version,
            range = %range,
            rows,
            created,
            superseded = change.superseded.len(),
            "Assigned payload"
        );

        Ok(AssignOutcome {
            uuid,
            version: change.version,
            created,
            rows,
            discrepancy,
            superseded: change.superseded.iter().map(|r| r.version).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::payload::tests::{batch, values};
    use crate::backend::ParquetArrayBackend;
    use crate::catalog::CatalogConfig;
    use crate::lock::{LockConfig, LockManager, ObjectStoreLockManager};
    use object_store::memory::InMemory;
    use object_store::ObjectStore;
    use std::time::Duration;

    fn metadata(inlet: &str) -> Metadata {
        Metadata::new()
            .with("data_type", "surface")
            .with("site", "tac")
            .with("species", "ch4")
            .with("inlet", inlet)
    }

    fn r(start: i64, end: i64) -> DateRange {
        DateRange::from_nanos(start, end).unwrap()
    }

    struct Fixture {
        object_store: Arc<dyn ObjectStore>,
        catalog: Arc<CatalogStore>,
        backend: Arc<ParquetArrayBackend>,
        engine: AssignmentEngine,
    }

    fn fixture() -> Fixture {
        let object_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let locks: Arc<dyn LockManager> = Arc::new(ObjectStoreLockManager::new(
            object_store.clone(),
            LockConfig::default(),
            "test",
        ));
        let catalog = Arc::new(CatalogStore::new(
            object_store.clone(),
            locks,
            "test",
            CatalogConfig {
                cache_ttl: Duration::ZERO,
                lock_timeout: Duration::from_millis(200),
            },
        ));
        let backend = Arc::new(ParquetArrayBackend::new(object_store.clone(), "test"));
        let engine = AssignmentEngine::new(catalog.clone(), backend.clone(), "test");
        Fixture {
            object_store,
            catalog,
            backend,
            engine,
        }
    }

    async fn object_count(store: &Arc<dyn ObjectStore>) -> usize {
        store
            .list_with_delimiter(None)
            .await
            .map(|listing| listing.common_prefixes.len() + listing.objects.len())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_first_upload_creates_then_extends() {
        let f = fixture();
        let first = f
            .engine
            .assign(AssignRequest::new(metadata("42m"), batch(&[0, 5], &[0.0, 5.0]), r(0, 10)))
            .await
            .unwrap();
        assert!(first.created);
        assert_eq!(first.version, 1);

        let second = f
            .engine
            .assign(AssignRequest::new(
                metadata("42M").with("units", "ppb"),
                batch(&[10, 15], &[10.0, 15.0]),
                r(10, 20),
            ))
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.uuid, first.uuid);
        assert_eq!(second.version, 2);

        let catalog = f.catalog.refresh().await.unwrap();
        let ds = catalog.get(&first.uuid).unwrap();
        assert_eq!(ds.coverage(), vec![r(0, 20)]);
        assert_eq!(ds.metadata().canonical("units").as_deref(), Some("ppb"));
    }

    #[tokio::test]
    async fn test_different_inlets_are_different_datasources() {
        let f = fixture();
        let a = f
            .engine
            .assign(AssignRequest::new(metadata("42m"), batch(&[0], &[0.0]), r(0, 10)))
            .await
            .unwrap();
        let b = f
            .engine
            .assign(AssignRequest::new(metadata("100m"), batch(&[0], &[0.0]), r(0, 10)))
            .await
            .unwrap();
        assert_ne!(a.uuid, b.uuid);
        assert!(b.created);
    }

    #[tokio::test]
    async fn test_out_of_range_rows_are_rejected() {
        let f = fixture();
        let err = f
            .engine
            .assign(AssignRequest::new(metadata("42m"), batch(&[0, 10], &[0.0, 1.0]), r(0, 10)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRange(_)));
        assert_eq!(object_count(&f.object_store).await, 0);
    }

    #[tokio::test]
    async fn test_empty_payload_is_rejected() {
        let f = fixture();
        let err = f
            .engine
            .assign(AssignRequest::new(metadata("42m"), batch(&[], &[]), r(0, 10)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn test_duplicates_reported_and_removed() {
        let f = fixture();
        let outcome = f
            .engine
            .assign(
                AssignRequest::new(metadata("42m"), batch(&[1, 1, 2], &[1.0, 9.0, 2.0]), r(0, 10))
                    .with_duplicate_policy(DuplicatePolicy::KeepLast),
            )
            .await
            .unwrap();
        assert_eq!(outcome.rows, 2);
        assert_eq!(outcome.discrepancy.unwrap().duplicates_removed, 1);

        let catalog = f.catalog.refresh().await.unwrap();
        let ds = catalog.get(&outcome.uuid).unwrap();
        let record = ds.version(outcome.version).unwrap();
        let stored = f.backend.read(&record.payload).await.unwrap();
        assert_eq!(values(&stored), vec![9.0, 2.0]);
    }

    #[tokio::test]
    async fn test_reject_policy_removes_orphan_payload() {
        let f = fixture();
        let first = f
            .engine
            .assign(AssignRequest::new(metadata("42m"), batch(&[0], &[0.0]), r(0, 10)))
            .await
            .unwrap();

        let err = f
            .engine
            .assign(
                AssignRequest::new(metadata("42m"), batch(&[5], &[5.0]), r(5, 15))
                    .with_overlap_policy(OverlapPolicy::Reject),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DataOverlap(_)));

        let listing = f
            .object_store
            .list_with_delimiter(Some(&object_store::path::Path::from(format!(
                "data/{}",
                first.uuid
            ))))
            .await
            .unwrap();
        assert_eq!(listing.objects.len(), 1);
    }

    #[tokio::test]
    async fn test_ambiguous_fingerprint_needs_target() {
        let f = fixture();
        // Two Datasources with one fingerprint can only come from outside
        // the engine, e.g. a merged catalog
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        f.catalog
            .update("seed", |catalog| {
                catalog.insert(Datasource::new(a, metadata("42m"))?)?;
                catalog.insert(Datasource::new(b, metadata("42m"))?)
            })
            .await
            .unwrap();

        let err = f
            .engine
            .assign(AssignRequest::new(metadata("42m"), batch(&[0], &[0.0]), r(0, 10)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DatasourceLookup(_)));

        let outcome = f
            .engine
            .assign(
                AssignRequest::new(metadata("42m"), batch(&[0], &[0.0]), r(0, 10)).with_target(b),
            )
            .await
            .unwrap();
        assert_eq!(outcome.uuid, b);

        let err = f
            .engine
            .assign(
                AssignRequest::new(metadata("100m"), batch(&[0], &[0.0]), r(0, 10))
                    .with_target(b),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DatasourceLookup(_)));
    }

    #[tokio::test]
    async fn test_superseded_payload_is_deleted() {
        let f = fixture();
        let first = f
            .engine
            .assign(AssignRequest::new(metadata("42m"), batch(&[0], &[0.0]), r(0, 10)))
            .await
            .unwrap();
        let catalog = f.catalog.refresh().await.unwrap();
        let old = catalog
            .get(&first.uuid)
            .unwrap()
            .version(1)
            .unwrap()
            .payload
            .clone();

        let second = f
            .engine
            .assign(AssignRequest::new(metadata("42m"), batch(&[0], &[1.0]), r(0, 10)))
            .await
            .unwrap();
        assert_eq!(second.superseded, vec![1]);
        assert!(f.backend.read(&old).await.is_err());
    }
}
