//! Validator-keyed response cache.
//!
//! Entries are immutable and handed out as `Arc` snapshots; a re-fetch replaces
//! the whole entry. Invalid entries are evicted lazily on lookup, by
//! [`ResponseCache::sweep_expired`], or by the background task started with
//! [`ResponseCache::spawn_sweeper`].

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Lifetime in seconds of an entry stored without an explicit expiry.
pub const DEFAULT_TTL_SECS: i64 = 300;
/// Shortest interval the background sweeper runs at.
pub const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry<T> {
    pub validator: String,
    pub payload: T,
    pub cached_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl<T> CacheEntry<T> {
    /// Valid strictly before `expires_at`, or before `cached_at + 5m` when no
    /// expiry was given.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now < expires_at,
            None => now < self.cached_at + ChronoDuration::seconds(DEFAULT_TTL_SECS),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }
}

/// Concurrent store keyed by logical request identity (the request URL).
#[derive(Debug)]
pub struct ResponseCache<T> {
    entries: RwLock<HashMap<String, Arc<CacheEntry<T>>>>,
}

impl<T> Default for ResponseCache<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> ResponseCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Arc<CacheEntry<T>>> {
        self.get_at(key, Utc::now()).await
    }

    /// Returns the entry only if it is valid at `now`; an invalid entry is
    /// removed and reported as a miss.
    pub async fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<Arc<CacheEntry<T>>> {
        let stale = {
            let entries = self.entries.read().await;
            let entry = entries.get(key)?;
            if entry.is_valid_at(now) {
                return Some(Arc::clone(entry));
            }
            Arc::clone(entry)
        };
        let mut entries = self.entries.write().await;
        // Only evict the entry we judged stale; a concurrent set may have replaced it.
        if entries
            .get(key)
            .map(|current| Arc::ptr_eq(current, &stale))
            .unwrap_or(false)
        {
            entries.remove(key);
            debug!("cache: evicted stale entry {}", key);
        }
        None
    }

    pub async fn set(
        &self,
        key: impl Into<String>,
        validator: impl Into<String>,
        payload: T,
        expires_at: Option<DateTime<Utc>>,
    ) {
        self.set_at(key, validator, payload, expires_at, Utc::now())
            .await
    }

    /// Unconditionally replaces any entry for `key`, stamping it as cached at `now`.
    pub async fn set_at(
        &self,
        key: impl Into<String>,
        validator: impl Into<String>,
        payload: T,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        let entry = Arc::new(CacheEntry {
            validator: validator.into(),
            payload,
            cached_at: now,
            expires_at,
        });
        self.entries.write().await.insert(key.into(), entry);
    }

    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now()).await
    }

    /// Removes every entry invalid at `now` and returns how many were removed.
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_valid_at(now));
        before - entries.len()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Number of stored entries, including ones not yet evicted.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn contains_key(&self, key: &str) -> bool {
        self.entries.read().await.contains_key(key)
    }
}

impl<T: Send + Sync + 'static> ResponseCache<T> {
    /// Sweeps expired entries every `period` until `shutdown` flips to `true`
    /// (or its sender is dropped). Resolves to the total number evicted.
    /// Periods under [`MIN_SWEEP_PERIOD`] are raised to it.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<usize> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(MIN_SWEEP_PERIOD));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut evicted = 0usize;
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let n = cache.sweep_expired().await;
                        if n > 0 {
                            debug!("cache sweeper evicted {} entries", n);
                        }
                        evicted += n;
                    }
                }
            }
            debug!("cache sweeper stopped after evicting {} entries", evicted);
            evicted
        })
    }
}
