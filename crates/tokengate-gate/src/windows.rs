//! Daily and hourly usage windows.
//!
//! Window sums are always derived from the usage log, never from
//! separately maintained counters, so they cannot drift from the record
//! of what actually happened. A short-TTL memo keeps the admission path
//! from hitting the store on every call; recorded usage is written
//! through into any live memo entry so a cached sum can understate
//! remaining headroom but never overstate it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Timelike, Utc};
use tokengate_core::{day_key, hour_key, Provider, UsageStore};
use tracing::warn;

struct MemoEntry {
    total: u64,
    fetched_at: Instant,
}

/// Log-derived daily and hourly token sums per provider.
pub struct RateWindowTracker {
    store: Arc<dyn UsageStore>,
    ttl: Duration,
    memo: Mutex<HashMap<(Provider, String), MemoEntry>>,
}

impl RateWindowTracker {
    /// Create a tracker over the given store with the given memo TTL.
    pub fn new(store: Arc<dyn UsageStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// Tokens used by a provider in the current UTC calendar day.
    pub async fn daily_usage(&self, provider: Provider, now: DateTime<Utc>) -> u64 {
        let (start, end) = day_bounds(now);
        self.window_sum(provider, day_key(now), start, end).await
    }

    /// Tokens used by a provider in the current UTC clock hour.
    pub async fn hourly_usage(&self, provider: Provider, now: DateTime<Utc>) -> u64 {
        let (start, end) = hour_bounds(now);
        self.window_sum(provider, hour_key(now), start, end).await
    }

    /// Fold freshly recorded usage into any live memo entries.
    ///
    /// Only bumps entries that already exist; an absent entry will be
    /// refetched from the log, which already contains the new usage.
    pub fn note_usage(&self, provider: Provider, tokens: u64, at: DateTime<Utc>) {
        let mut memo = lock_memo(&self.memo);
        for key in [day_key(at), hour_key(at)] {
            if let Some(entry) = memo.get_mut(&(provider, key)) {
                entry.total += tokens;
            }
        }
    }

    /// Drop all cached sums for a provider. Used after a usage reset,
    /// the one operation that makes sums go backwards.
    pub fn invalidate(&self, provider: Provider) {
        lock_memo(&self.memo).retain(|(p, _), _| *p != provider);
    }

    async fn window_sum(
        &self,
        provider: Provider,
        bucket: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> u64 {
        {
            let memo = lock_memo(&self.memo);
            if let Some(entry) = memo.get(&(provider, bucket.clone())) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return entry.total;
                }
            }
        }

        match self.store.window_total(provider, start, end).await {
            Ok(total) => {
                lock_memo(&self.memo).insert(
                    (provider, bucket),
                    MemoEntry {
                        total,
                        fetched_at: Instant::now(),
                    },
                );
                total
            }
            Err(e) => {
                // Fail open: an unreadable store must not block calls.
                warn!(%provider, error = %e, "Window sum unavailable, assuming zero");
                0
            }
        }
    }
}

fn lock_memo(
    memo: &Mutex<HashMap<(Provider, String), MemoEntry>>,
) -> std::sync::MutexGuard<'_, HashMap<(Provider, String), MemoEntry>> {
    match memo.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn day_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .unwrap_or_default()
        .and_utc();
    (start, start + chrono::Duration::days(1))
}

fn hour_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = now
        .date_naive()
        .and_hms_opt(now.hour(), 0, 0)
        .unwrap_or_default()
        .and_utc();
    (start, start + chrono::Duration::hours(1))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
