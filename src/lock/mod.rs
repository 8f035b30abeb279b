//! Bounded-wait mutual exclusion for bucket documents
//!
//! Mutations of a bucket's catalog and of each ranking group are serialized
//! through a named lock. Acquisition never blocks indefinitely: it either
//! succeeds within the caller's timeout or fails with
//! [`Error::MutexTimeout`](crate::Error::MutexTimeout).
//!
//! The only required property of a [`LockManager`] is a bounded acquire;
//! [`ObjectStoreLockManager`] implements it with create-if-absent lease
//! objects, which works across processes sharing a filesystem bucket.

mod lease;

pub use lease::ObjectStoreLockManager;

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lock timing configuration
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Maximum time to wait for a lock
    pub timeout: Duration,
    /// Lifetime of a lease before other processes may break it
    pub lease_ttl: Duration,
    /// Clock skew tolerated between processes
    pub max_skew: Duration,
    /// First retry delay under contention
    pub base_backoff: Duration,
    /// Upper bound for the retry delay
    pub max_backoff: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            lease_ttl: Duration::from_secs(300),
            max_skew: Duration::from_secs(30),
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
        }
    }
}

/// A held lock, as recorded in the lock document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockLease {
    pub name: String,
    pub token: Uuid,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Named mutex with bounded acquisition.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquire `name`, waiting at most `timeout`.
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockLease>;

    /// Release a lease obtained from [`acquire`](Self::acquire).
    async fn release(&self, lease: &LockLease) -> Result<()>;
}

/// RAII wrapper around a [`LockLease`].
///
/// Call [`release`](Self::release) on the happy path. Dropping an
/// unreleased guard schedules the release on the current tokio runtime;
/// the lease TTL covers the case where no runtime is available.
pub struct LockGuard {
    manager: Arc<dyn LockManager>,
    lease: Option<LockLease>,
}

impl LockGuard {
    pub async fn acquire(
        manager: Arc<dyn LockManager>,
        name: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let lease = manager.acquire(name, timeout).await?;
        Ok(Self {
            manager,
            lease: Some(lease),
        })
    }

    pub fn name(&self) -> &str {
        self.lease.as_ref().map(|l| l.name.as_str()).unwrap_or("")
    }

    pub async fn release(mut self) -> Result<()> {
        match self.lease.take() {
            Some(lease) => self.manager.release(&lease).await,
            None => Ok(()),
        }
    }

    /// Release once the guarded write has already committed or failed.
    ///
    /// The outcome of the write stands either way; a lease that could not
    /// be removed is left to expire.
    pub async fn release_or_expire(self) {
        let name = self.name().to_string();
        if let Err(e) = self.release().await {
            warn!(lock = %name, error = %e, "Lock release failed; lease will expire on its own");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let manager = Arc::clone(&self.manager);
                debug!(lock = %lease.name, "Releasing dropped lock guard in background");
                handle.spawn(async move {
                    if let Err(e) = manager.release(&lease).await {
                        warn!(lock = %lease.name, error = %e, "Background lock release failed");
                    }
                });
            }
            Err(_) => warn!(
                lock = %lease.name,
                "Lock guard dropped outside a runtime; lease will expire on its own"
            ),
        }
    }
}
