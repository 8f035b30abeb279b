//! Rank documents, one per group, each behind its own lock

use super::{GroupKey, RankBook, RankEntry};
use crate::catalog::document;
use crate::lock::{LockGuard, LockManager};
use crate::{Error, Result};

use object_store::path::Path;
use object_store::ObjectStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const RANKS_PREFIX: &str = "ranks";

/// Reads and updates the rank documents of one bucket.
pub struct RankStore {
    object_store: Arc<dyn ObjectStore>,
    locks: Arc<dyn LockManager>,
    bucket: String,
    lock_timeout: Duration,
}

impl RankStore {
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        locks: Arc<dyn LockManager>,
        bucket: &str,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            object_store,
            locks,
            bucket: bucket.to_string(),
            lock_timeout,
        }
    }

    fn path(group: &GroupKey) -> Path {
        Path::from_iter([RANKS_PREFIX, &format!("{}.json", group.slug())])
    }

    fn lock_name(group: &GroupKey) -> String {
        format!("rank-{}", group.slug())
    }

    async fn load(&self, group: &GroupKey) -> Result<(RankBook, String)> {
        let (mut book, e_tag): (RankBook, String) =
            document::load_document(self.object_store.as_ref(), &Self::path(group)).await?;
        if e_tag == document::NO_ETAG {
            book.group = group.clone();
        } else if &book.group != group {
            // Two groups whose slugs collide
            return Err(Error::Internal(format!(
                "rank document {} belongs to group {}, not {}",
                Self::path(group),
                book.group,
                group
            )));
        }
        Ok((book, e_tag))
    }

    /// Current entries of `group`; empty when nothing is ranked.
    pub async fn get_ranks(&self, group: &GroupKey) -> Result<Vec<RankEntry>> {
        let (book, _) = self.load(group).await?;
        Ok(book.entries().to_vec())
    }

    /// Mutate `group`'s rank book under the group lock.
    pub async fn update<T, F>(&self, group: &GroupKey, f: F) -> Result<T>
    where
        F: FnOnce(&mut RankBook) -> Result<T>,
    {
        let guard = LockGuard::acquire(
            Arc::clone(&self.locks),
            &Self::lock_name(group),
            self.lock_timeout,
        )
        .await?;

        let result = self.update_locked(group, f).await;
        guard.release_or_expire().await;
        result
    }

    async fn update_locked<T, F>(&self, group: &GroupKey, f: F) -> Result<T>
    where
        F: FnOnce(&mut RankBook) -> Result<T>,
    {
        let (mut book, e_tag) = self.load(group).await?;
        let before = book.clone();
        let out = f(&mut book)?;
        if book == before {
            return Ok(out);
        }

        let path = Self::path(group);
        if book.is_empty() && e_tag != document::NO_ETAG {
            document::delete_document(self.object_store.as_ref(), &path).await?;
        } else {
            document::store_document(
                self.object_store.as_ref(),
                &path,
                &book,
                &e_tag,
                &self.bucket,
                "rank",
            )
            .await?;
        }
        debug!(bucket = %self.bucket, group = %group, entries = book.entries().len(), "Rank document updated");
        Ok(out)
    }

    /// Every group with a rank document.
    pub async fn groups(&self) -> Result<Vec<GroupKey>> {
        let prefix = Path::from(RANKS_PREFIX);
        let listing = self.object_store.list_with_delimiter(Some(&prefix)).await?;
        let mut groups = Vec::with_capacity(listing.objects.len());
        for meta in listing.objects {
            match document::load_document::<RankBook>(self.object_store.as_ref(), &meta.location)
                .await
            {
                Ok((book, _)) if !book.group.pairs().is_empty() => groups.push(book.group),
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %meta.location, error = %e, "Skipping unreadable rank document")
                }
            }
        }
        groups.sort();
        Ok(groups)
    }
}
