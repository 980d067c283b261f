//! Shared key-value store abstraction.
//!
//! Every piece of cross-request bookkeeping (rate-limit counters,
//! idempotency records) goes through the [`KeyValueStore`] trait rather than
//! process-local maps, so the middleware scales across multiple independent
//! processes pointed at the same backing store.
//!
//! # Atomicity
//!
//! Two operations carry the concurrency contract the pipeline relies on:
//!
//! - [`KeyValueStore::incr_atomic`]: increment-and-read must be atomic so two
//!   concurrent requests can never both observe "under limit".
//! - [`KeyValueStore::set_if_absent`]: create-if-absent must be atomic so
//!   exactly one concurrent caller wins an idempotency key.
//!
//! The bundled [`MemoryStore`] satisfies both by serializing mutations behind
//! a single write lock. A networked implementation (e.g. Redis `INCR` /
//! `SET NX`) satisfies them with the store's native atomic primitives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::trace;

/// Errors surfaced by store implementations.
///
/// The pipeline maps these through the per-limiter-class failure policy;
/// it never retries a store operation itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("stored value is corrupt: {0}")]
    Corrupt(String),
}

/// Shared key-value store with TTL support.
///
/// Implementations must be safe for concurrent use from many request
/// handlers. All methods are non-blocking network operations; the request
/// suspends while awaiting them.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch the value for `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set `key` to `value`, overwriting any existing entry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Atomically create `key` only if it is absent (or expired).
    ///
    /// Returns `true` if this call created the entry, `false` if another
    /// writer already holds the key.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Atomically increment the counter at `key` and return the new value.
    ///
    /// A missing or expired key is created at 1; `ttl` applies only on
    /// creation so the window expiry is anchored to the first hit.
    async fn incr_atomic(&self, key: &str, ttl: Option<Duration>) -> Result<u64, StoreError>;

    /// Remove `key` if present.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// A single stored entry with optional expiry.
#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory [`KeyValueStore`] implementation.
///
/// Suitable for a single-process deployment and for tests. Expired entries
/// are treated as absent on read and reclaimed by [`MemoryStore::sweep_expired`],
/// which the application state runs on a background interval.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove all expired entries.
    ///
    /// Reads only need to skip expired entries; this reclaims their memory
    /// in long-running processes.
    pub async fn sweep_expired(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            trace!(removed, "Swept expired store entries");
        }
    }

    /// Number of live (possibly expired but unswept) entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the store holds no entries at all.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired(Instant::now()))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        // Expired entries count as absent; the first writer after expiry wins.
        if let Some(existing) = entries.get(key)
            && !existing.is_expired(now)
        {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(true)
    }

    async fn incr_atomic(&self, key: &str, ttl: Option<Duration>) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                let current: u64 = entry
                    .value
                    .parse()
                    .map_err(|_| StoreError::Corrupt(format!("non-numeric counter at {key}")))?;
                let next = current.saturating_add(1);
                entry.value = next.to_string();
                Ok(next)
            }
            _ => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: "1".to_string(),
                        expires_at: ttl.map(|t| now + t),
                    },
                );
                Ok(1)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }
}
