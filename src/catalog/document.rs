//! ETag-versioned JSON documents on an object store
//!
//! Catalog and rank documents are read together with their ETag and
//! written back with a conditional put. The first write of a document uses
//! `PutMode::Create`; later writes use `PutMode::Update` against the ETag
//! that was read. Stores without conditional updates fall back to a plain
//! overwrite, which is safe because every writer holds the document's lock.

use crate::{Error, Result};
use metrics::{counter, histogram};
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, warn};

/// ETag placeholder for a document that does not exist yet.
pub const NO_ETAG: &str = "none";

/// Read a JSON document and its ETag; a missing document yields `T::default()`.
pub async fn load_document<T>(object_store: &dyn ObjectStore, path: &Path) -> Result<(T, String)>
where
    T: DeserializeOwned + Default,
{
    match object_store.get(path).await {
        Ok(result) => {
            let e_tag = result
                .meta
                .e_tag
                .clone()
                .unwrap_or_else(|| "no-etag".to_string());
            let bytes = result.bytes().await?;
            if bytes.is_empty() {
                debug!(path = %path, "Empty document");
                return Ok((T::default(), e_tag));
            }
            let document = serde_json::from_slice(&bytes)
                .map_err(|e| Error::Serialization(format!("Corrupt document {}: {}", path, e)))?;
            Ok((document, e_tag))
        }
        Err(object_store::Error::NotFound { .. }) => Ok((T::default(), NO_ETAG.to_string())),
        Err(e) => Err(Error::ObjectStore(e)),
    }
}

/// Write `document` over the version identified by `expected_etag`.
///
/// A precondition failure means another writer got in between, which can
/// only happen if our lock lease was broken; it surfaces as
/// [`Error::Conflict`].
pub async fn store_document<T: Serialize>(
    object_store: &dyn ObjectStore,
    path: &Path,
    document: &T,
    expected_etag: &str,
    bucket: &str,
    operation: &str,
) -> Result<()> {
    let started = Instant::now();
    let payload = PutPayload::from(serde_json::to_vec_pretty(document)?);
    let opts = if expected_etag == NO_ETAG {
        PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        }
    } else {
        PutOptions {
            mode: PutMode::Update(UpdateVersion {
                e_tag: Some(expected_etag.to_string()),
                version: None,
            }),
            ..Default::default()
        }
    };

    let result = match object_store.put_opts(path, payload.clone(), opts).await {
        Ok(_) => Ok("ok"),
        Err(object_store::Error::AlreadyExists { .. })
        | Err(object_store::Error::Precondition { .. }) => Err(Error::Conflict),
        Err(object_store::Error::NotImplemented)
        | Err(object_store::Error::NotSupported { .. }) => {
            debug!(path = %path, "Conditional put unsupported, overwriting under lock");
            object_store
                .put_opts(
                    path,
                    payload,
                    PutOptions {
                        mode: PutMode::Overwrite,
                        ..Default::default()
                    },
                )
                .await
                .map(|_| "overwrite")
                .map_err(Error::ObjectStore)
        }
        Err(e) => Err(Error::ObjectStore(e)),
    };

    let label = match &result {
        Ok(label) => *label,
        Err(Error::Conflict) => "conflict",
        Err(_) => "error",
    };
    counter!(
        "seriesvault_document_swaps_total",
        "service" => crate::telemetry::service(),
        "bucket" => bucket.to_string(),
        "operation" => operation.to_string(),
        "result" => label
    )
    .increment(1);
    histogram!(
        "seriesvault_document_swap_duration_seconds",
        "service" => crate::telemetry::service(),
        "bucket" => bucket.to_string(),
        "operation" => operation.to_string()
    )
    .record(started.elapsed().as_secs_f64());

    if matches!(result, Err(Error::Conflict)) {
        warn!(
            path = %path,
            operation,
            "Document changed while locked; the lock lease was probably broken"
        );
    }
    result.map(|_| ())
}

/// Delete a document, ignoring a missing one.
pub async fn delete_document(object_store: &dyn ObjectStore, path: &Path) -> Result<()> {
    match object_store.delete(path).await {
        Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
        Err(e) => Err(Error::ObjectStore(e)),
    }
}
