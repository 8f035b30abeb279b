//! Lease timestamps that tolerate clock skew between processes
//!
//! Lease documents carry wall-clock stamps written by whichever process
//! holds the lock. Stamps issued here never go backward within a process,
//! and expiry checks on other processes' stamps allow a configured skew.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Validity window written into a lease document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseWindow {
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Issues lease stamps and judges whether foreign leases have lapsed.
#[derive(Debug)]
pub struct LeaseClock {
    /// Latest stamp handed out, epoch nanos
    last_ns: AtomicI64,
    max_skew: Duration,
}

impl LeaseClock {
    pub fn new(max_skew: Duration) -> Self {
        Self {
            last_ns: AtomicI64::new(i64::MIN),
            max_skew,
        }
    }

    /// Current instant in epoch nanos, strictly after any earlier stamp.
    ///
    /// A wall clock stepped backward (NTP) yields the previous stamp + 1ns.
    pub fn now_nanos(&self) -> i64 {
        let wall = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        let mut candidate = wall;
        loop {
            let seen = self.last_ns.fetch_max(candidate, Ordering::AcqRel);
            if seen < candidate {
                return candidate;
            }
            candidate = seen.saturating_add(1);
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.now_nanos())
    }

    /// Stamp a lease valid for `ttl` from now.
    pub fn stamp(&self, ttl: Duration) -> LeaseWindow {
        let acquired_at = self.now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        LeaseWindow {
            acquired_at,
            expires_at: acquired_at
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Whether a lease stamped by another process has certainly lapsed.
    ///
    /// Its deadline is pushed back by `max_skew` so a holder whose clock
    /// runs behind ours keeps a lease that is still valid on its side.
    pub fn lease_expired(&self, expires_at: DateTime<Utc>) -> bool {
        let skew = i64::try_from(self.max_skew.as_nanos()).unwrap_or(i64::MAX);
        let deadline = expires_at.timestamp_nanos_opt().unwrap_or(i64::MAX);
        self.now_nanos() > deadline.saturating_add(skew)
    }

    pub fn max_skew(&self) -> Duration {
        self.max_skew
    }
}

impl Default for LeaseClock {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
