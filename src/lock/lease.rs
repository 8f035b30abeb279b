//! Lease-object lock on an object store
//!
//! A lock is held while `locks/<name>.lock` exists. Acquisition creates it
//! with `PutMode::Create`, which is atomic on every backend that supports
//! conditional puts (including the local filesystem, where it is
//! cross-process). Contention is handled with capped exponential backoff
//! until the caller's timeout elapses.

use super::{LockConfig, LockLease, LockManager};
use crate::clock::LeaseClock;
use crate::{Error, Result};

use async_trait::async_trait;
use metrics::{counter, histogram};
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// A lease document together with the version it was read at.
struct StoredLease {
    lease: LockLease,
    version: UpdateVersion,
}

/// Lock manager storing leases next to the data they protect.
pub struct ObjectStoreLockManager {
    object_store: Arc<dyn ObjectStore>,
    config: LockConfig,
    clock: LeaseClock,
    /// Identifies this process in lease documents
    holder: String,
    /// Bucket name, for metrics labels
    bucket: String,
}

impl ObjectStoreLockManager {
    pub fn new(object_store: Arc<dyn ObjectStore>, config: LockConfig, bucket: &str) -> Self {
        let clock = LeaseClock::new(config.max_skew);
        Self {
            object_store,
            config,
            clock,
            holder: format!("pid-{}-{}", std::process::id(), Uuid::new_v4()),
            bucket: bucket.to_string(),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn lock_path(name: &str) -> Path {
        Path::from_iter(["locks", &format!("{}.lock", name)])
    }

    fn new_lease(&self, name: &str) -> LockLease {
        let window = self.clock.stamp(self.config.lease_ttl);
        LockLease {
            name: name.to_string(),
            token: Uuid::new_v4(),
            holder: self.holder.clone(),
            acquired_at: window.acquired_at,
            expires_at: window.expires_at,
        }
    }

    /// Read the current lease and the version it was read at, `None` if
    /// the lock is free.
    async fn read_lease(&self, path: &Path) -> Result<Option<StoredLease>> {
        match self.object_store.get(path).await {
            Ok(result) => {
                let version = UpdateVersion {
                    e_tag: result.meta.e_tag.clone(),
                    version: result.meta.version.clone(),
                };
                let bytes = result.bytes().await?;
                let lease = match serde_json::from_slice::<LockLease>(&bytes) {
                    Ok(lease) => lease,
                    Err(e) => {
                        // Leases are written in one put; an unreadable one is
                        // treated as abandoned.
                        warn!(path = %path, error = %e, "Unreadable lock lease");
                        LockLease {
                            name: path.to_string(),
                            token: Uuid::nil(),
                            holder: "unknown".to_string(),
                            acquired_at: chrono::DateTime::UNIX_EPOCH,
                            expires_at: chrono::DateTime::UNIX_EPOCH,
                        }
                    }
                };
                Ok(Some(StoredLease { lease, version }))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(Error::ObjectStore(e)),
        }
    }

    /// Take over an expired lease.
    ///
    /// The new lease is written with `PutMode::Update` against the exact
    /// version judged expired, so of several contenders only one succeeds.
    /// Returns the new lease if this process now holds the lock.
    async fn break_expired(
        &self,
        name: &str,
        path: &Path,
        stale: &StoredLease,
    ) -> Result<Option<LockLease>> {
        if stale.version.e_tag.is_none() && stale.version.version.is_none() {
            self.break_with_marker(name, path, &stale.lease).await?;
            return Ok(None);
        }

        let lease = self.new_lease(name);
        let payload = PutPayload::from(serde_json::to_vec(&lease)?);
        let opts = PutOptions {
            mode: PutMode::Update(stale.version.clone()),
            ..Default::default()
        };
        match self.object_store.put_opts(path, payload, opts).await {
            Ok(_) => Ok(Some(lease)),
            Err(object_store::Error::Precondition { .. })
            | Err(object_store::Error::NotFound { .. }) => {
                debug!(lock = name, bucket = %self.bucket, "Expired lease already taken over");
                Ok(None)
            }
            Err(object_store::Error::NotImplemented)
            | Err(object_store::Error::NotSupported { .. }) => {
                self.break_with_marker(name, path, &stale.lease).await?;
                Ok(None)
            }
            Err(e) => Err(Error::ObjectStore(e)),
        }
    }

    /// Break an expired lease on stores without conditional updates.
    ///
    /// Contenders race to create a marker named after the expired lease's
    /// token; only the winner deletes the lease, and only if it still
    /// carries that token. Markers left by a crashed breaker expire like
    /// leases do.
    async fn break_with_marker(&self, name: &str, path: &Path, stale: &LockLease) -> Result<()> {
        let marker = Path::from_iter(["locks", &format!("{}.break-{}", name, stale.token)]);
        let claim = self.new_lease(name);
        let opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        match self
            .object_store
            .put_opts(&marker, PutPayload::from(serde_json::to_vec(&claim)?), opts)
            .await
        {
            Ok(_) => {}
            Err(object_store::Error::AlreadyExists { .. }) => {
                if let Some(other) = self.read_lease(&marker).await? {
                    if self.clock.lease_expired(other.lease.expires_at) {
                        warn!(lock = name, bucket = %self.bucket, "Removing abandoned break marker");
                        self.delete_lease(&marker).await?;
                    }
                }
                return Ok(());
            }
            Err(e) => return Err(Error::ObjectStore(e)),
        }

        let outcome = match self.read_lease(path).await {
            Ok(Some(current)) if current.lease.token == stale.token => {
                self.delete_lease(path).await
            }
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = self.delete_lease(&marker).await {
            warn!(lock = name, bucket = %self.bucket, error = %e, "Failed to remove break marker");
        }
        outcome
    }

    async fn delete_lease(&self, path: &Path) -> Result<()> {
        match self.object_store.delete(path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(Error::ObjectStore(e)),
        }
    }

    fn backoff(&self, attempt: u32, remaining: Duration) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.config
            .base_backoff
            .saturating_mul(factor)
            .min(self.config.max_backoff)
            .min(remaining)
    }

    fn record(&self, name: &str, result: &'static str, waited: Duration) {
        counter!(
            "seriesvault_lock_acquisitions_total",
            "service" => crate::telemetry::service(),
            "bucket" => self.bucket.clone(),
            "lock" => name.to_string(),
            "result" => result
        )
        .increment(1);
        histogram!(
            "seriesvault_lock_wait_seconds",
            "service" => crate::telemetry::service(),
            "bucket" => self.bucket.clone(),
            "result" => result
        )
        .record(waited.as_secs_f64());
    }
}

#[async_trait]
impl LockManager for ObjectStoreLockManager {
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockLease> {
        let path = Self::lock_path(name);
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            let lease = self.new_lease(name);
            let payload = PutPayload::from(serde_json::to_vec(&lease)?);
            let opts = PutOptions {
                mode: PutMode::Create,
                ..Default::default()
            };

            match self.object_store.put_opts(&path, payload, opts).await {
                Ok(_) => {
                    let waited = started.elapsed();
                    self.record(name, "ok", waited);
                    debug!(
                        lock = name,
                        bucket = %self.bucket,
                        waited_ms = waited.as_millis() as u64,
                        attempts = attempt + 1,
                        "Lock acquired"
                    );
                    return Ok(lease);
                }
                Err(object_store::Error::AlreadyExists { .. }) => {
                    match self.read_lease(&path).await? {
                        Some(current) if self.clock.lease_expired(current.lease.expires_at) => {
                            warn!(
                                lock = name,
                                bucket = %self.bucket,
                                holder = %current.lease.holder,
                                expired_at = %current.lease.expires_at,
                                "Breaking expired lock lease"
                            );
                            if let Some(lease) = self.break_expired(name, &path, &current).await? {
                                let waited = started.elapsed();
                                self.record(name, "broken", waited);
                                return Ok(lease);
                            }
                        }
                        Some(_) => {}
                        // Released between our put and our read
                        None => continue,
                    }
                }
                Err(e) => return Err(Error::ObjectStore(e)),
            }

            let waited = started.elapsed();
            if waited >= timeout {
                self.record(name, "timeout", waited);
                debug!(lock = name, bucket = %self.bucket, "Lock acquisition timed out");
                return Err(Error::MutexTimeout {
                    lock: name.to_string(),
                    waited,
                });
            }

            tokio::time::sleep(self.backoff(attempt, timeout - waited)).await;
            attempt = attempt.saturating_add(1);
        }
    }

    async fn release(&self, lease: &LockLease) -> Result<()> {
        let path = Self::lock_path(&lease.name);
        match self.read_lease(&path).await? {
            Some(current) if current.lease.token == lease.token => {
                self.delete_lease(&path).await?;
                debug!(lock = %lease.name, bucket = %self.bucket, "Lock released");
                Ok(())
            }
            Some(current) => {
                warn!(
                    lock = %lease.name,
                    holder = %current.lease.holder,
                    "Lease was taken over before release; leaving the new holder in place"
                );
                Ok(())
            }
            None => {
                warn!(lock = %lease.name, "Lease vanished before release");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn config(timeout_ms: u64) -> LockConfig {
        LockConfig {
            timeout: Duration::from_millis(timeout_ms),
            lease_ttl: Duration::from_secs(60),
            max_skew: Duration::ZERO,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_second_acquirer_times_out() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let first = ObjectStoreLockManager::new(store.clone(), config(100), "b");
        let second = ObjectStoreLockManager::new(store, config(100), "b");

        let lease = first.acquire("index", Duration::from_millis(100)).await.unwrap();

        let err = second
            .acquire("index", Duration::from_millis(80))
            .await
            .unwrap_err();
        match err {
            Error::MutexTimeout { lock, waited } => {
                assert_eq!(lock, "index");
                assert!(waited >= Duration::from_millis(80));
            }
            other => panic!("expected MutexTimeout, got {other}"),
        }

        first.release(&lease).await.unwrap();
        let lease = second.acquire("index", Duration::from_millis(80)).await.unwrap();
        second.release(&lease).await.unwrap();
    }

    #[tokio::test]
    async fn test_independent_names_do_not_contend() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let manager = ObjectStoreLockManager::new(store, config(50), "b");

        let a = manager.acquire("index", Duration::from_millis(10)).await.unwrap();
        let b = manager.acquire("rank-site-tac", Duration::from_millis(10)).await.unwrap();
        manager.release(&a).await.unwrap();
        manager.release(&b).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_is_broken() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let mut short = config(50);
        short.lease_ttl = Duration::from_millis(1);
        let crashed = ObjectStoreLockManager::new(store.clone(), short, "b");
        let survivor = ObjectStoreLockManager::new(store, config(200), "b");

        let _abandoned = crashed.acquire("index", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let lease = survivor.acquire("index", Duration::from_millis(200)).await.unwrap();
        assert_ne!(lease.holder, _abandoned.holder);
        survivor.release(&lease).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_release_keeps_new_holder() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let mut short = config(50);
        short.lease_ttl = Duration::from_millis(1);
        let slow = ObjectStoreLockManager::new(store.clone(), short, "b");
        let other = ObjectStoreLockManager::new(store.clone(), config(200), "b");

        let stale = slow.acquire("index", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let fresh = other.acquire("index", Duration::from_millis(200)).await.unwrap();

        // The slow holder's release must not free the new holder's lock
        slow.release(&stale).await.unwrap();
        let err = slow.acquire("index", Duration::from_millis(30)).await;
        assert!(matches!(err, Err(Error::MutexTimeout { .. })));

        other.release(&fresh).await.unwrap();
    }

    /// A lease from a holder that stopped without releasing it.
    async fn abandoned(store: &Arc<dyn ObjectStore>) -> LockLease {
        let mut short = config(50);
        short.lease_ttl = Duration::from_millis(1);
        let crashed = ObjectStoreLockManager::new(store.clone(), short, "b");
        let lease = crashed.acquire("index", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        lease
    }

    async fn stored_token(manager: &ObjectStoreLockManager) -> Option<Uuid> {
        let path = ObjectStoreLockManager::lock_path("index");
        manager
            .read_lease(&path)
            .await
            .unwrap()
            .map(|stored| stored.lease.token)
    }

    /// Two contenders that both saw the same expired lease: one takes it over
    #[tokio::test]
    async fn test_expired_lease_taken_over_once() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let stale = abandoned(&store).await;
        let a = ObjectStoreLockManager::new(store.clone(), config(100), "b");
        let b = ObjectStoreLockManager::new(store.clone(), config(100), "b");
        let path = ObjectStoreLockManager::lock_path("index");

        let seen_by_a = a.read_lease(&path).await.unwrap().unwrap();
        let seen_by_b = b.read_lease(&path).await.unwrap().unwrap();
        assert_eq!(seen_by_a.lease.token, stale.token);

        let won = a.break_expired("index", &path, &seen_by_a).await.unwrap();
        let lost = b.break_expired("index", &path, &seen_by_b).await.unwrap();
        let won = won.unwrap();
        assert!(lost.is_none());
        assert_eq!(stored_token(&a).await, Some(won.token));

        assert!(matches!(
            b.acquire("index", Duration::from_millis(30)).await,
            Err(Error::MutexTimeout { .. })
        ));
        a.release(&won).await.unwrap();
    }

    /// Same race on a store without conditional updates
    #[tokio::test]
    async fn test_expired_lease_broken_once_without_conditional_update() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> =
            Arc::new(object_store::local::LocalFileSystem::new_with_prefix(dir.path()).unwrap());
        let stale = abandoned(&store).await;
        let a = ObjectStoreLockManager::new(store.clone(), config(100), "b");
        let b = ObjectStoreLockManager::new(store.clone(), config(100), "b");
        let path = ObjectStoreLockManager::lock_path("index");

        let seen_by_a = a.read_lease(&path).await.unwrap().unwrap();
        let seen_by_b = b.read_lease(&path).await.unwrap().unwrap();
        assert_eq!(seen_by_b.lease.token, stale.token);

        assert!(a.break_expired("index", &path, &seen_by_a).await.unwrap().is_none());
        let held = a.acquire("index", Duration::from_millis(50)).await.unwrap();

        // The late breaker must not remove the lease taken after the break
        assert!(b.break_expired("index", &path, &seen_by_b).await.unwrap().is_none());
        assert_eq!(stored_token(&a).await, Some(held.token));
        assert!(matches!(
            b.acquire("index", Duration::from_millis(30)).await,
            Err(Error::MutexTimeout { .. })
        ));

        a.release(&held).await.unwrap();
        assert_eq!(stored_token(&a).await, None);
    }

    #[tokio::test]
    async fn test_concurrent_breakers_are_exclusive() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let _stale = abandoned(&store).await;
        let a = ObjectStoreLockManager::new(store.clone(), config(100), "b");
        let b = ObjectStoreLockManager::new(store.clone(), config(100), "b");

        let (first, second) = tokio::join!(
            a.acquire("index", Duration::from_millis(60)),
            b.acquire("index", Duration::from_millis(60))
        );
        assert_eq!(
            [first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(),
            1,
            "exactly one contender may hold the lock"
        );
    }

    #[tokio::test]
    async fn test_zero_timeout_still_tries_once() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let manager = ObjectStoreLockManager::new(store, config(0), "b");
        let lease = manager.acquire("index", Duration::ZERO).await.unwrap();
        assert!(matches!(
            manager.acquire("index", Duration::ZERO).await,
            Err(Error::MutexTimeout { .. })
        ));
        manager.release(&lease).await.unwrap();
    }
}
