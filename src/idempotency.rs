//! Idempotency store for safe request retries.
//!
//! # State Machine
//!
//! Each `(key, tenant)` pair moves through `absent → pending → completed`.
//! [`IdempotencyStore::begin`] performs the `absent → pending` transition
//! with an atomic create-if-absent, so for N concurrent requests sharing a
//! key exactly one proceeds to the handler; the rest observe `pending` (or
//! `completed`) and receive a duplicate signal, which the pipeline turns
//! into `409 Conflict`.
//!
//! # Crash Safety
//!
//! A handler that dies between `begin` and `complete` leaves a `pending`
//! record behind. Pending records carry their own TTL; once expired they
//! count as absent again and a legitimate retry can start fresh. This is
//! also the safety net for clients that disconnect mid-pipeline: in-flight
//! store writes finish, and anything orphaned ages out.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MiddlewareError, MiddlewareResult};
use crate::store::KeyValueStore;

/// Lifecycle state of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// A request holding this key is still executing.
    Pending,
    /// The request finished; `result_hash` identifies its outcome.
    Completed,
}

/// Stored record for a `(key, tenant)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub status: RecordStatus,
    /// Hash of the completed response, for clients comparing retried outcomes.
    pub result_hash: Option<String>,
    /// Creation time, unix seconds.
    pub created_at: u64,
}

/// Outcome of [`IdempotencyStore::begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    /// This caller won the key; proceed to the handler.
    Proceed,
    /// Another request holds (or held) the key.
    Duplicate {
        status: RecordStatus,
        result_hash: Option<String>,
    },
}

/// Deduplicates retried requests by `(key, tenant)` over the shared store.
#[derive(Clone)]
pub struct IdempotencyStore {
    store: Arc<dyn KeyValueStore>,
    /// TTL for pending records: how long a crashed request blocks retries.
    pending_ttl: Duration,
    /// TTL for completed records: the retry-dedup horizon.
    completed_ttl: Duration,
}

impl IdempotencyStore {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        pending_ttl: Duration,
        completed_ttl: Duration,
    ) -> Self {
        Self {
            store,
            pending_ttl,
            completed_ttl,
        }
    }

    fn record_key(key: &str, tenant_id: &str) -> String {
        format!("idem:{tenant_id}:{key}")
    }

    /// Attempt the `absent → pending` transition for `(key, tenant)`.
    ///
    /// Atomic: exactly one of N concurrent callers gets
    /// [`BeginOutcome::Proceed`].
    ///
    /// # Errors
    ///
    /// Store failures surface as `MiddlewareError::Store`; idempotency is a
    /// correctness feature, so it never fails open.
    pub async fn begin(&self, key: &str, tenant_id: &str) -> MiddlewareResult<BeginOutcome> {
        let store_key = Self::record_key(key, tenant_id);
        let record = IdempotencyRecord {
            status: RecordStatus::Pending,
            result_hash: None,
            created_at: unix_now_secs(),
        };
        let serialized = serde_json::to_string(&record)
            .map_err(|e| MiddlewareError::Internal(format!("serialize idempotency record: {e}")))?;

        let created = self
            .store
            .set_if_absent(&store_key, &serialized, Some(self.pending_ttl))
            .await
            .map_err(|e| MiddlewareError::Store(e.to_string()))?;

        if created {
            debug!(key, tenant_id, "Idempotency key acquired");
            return Ok(BeginOutcome::Proceed);
        }

        // Lost the race (or a prior attempt already ran): report what holds
        // the key so the caller can answer 409 with context.
        let existing = self
            .store
            .get(&store_key)
            .await
            .map_err(|e| MiddlewareError::Store(e.to_string()))?;

        match existing {
            Some(raw) => {
                let record: IdempotencyRecord = serde_json::from_str(&raw).map_err(|e| {
                    MiddlewareError::Store(format!("corrupt idempotency record: {e}"))
                })?;
                debug!(key, tenant_id, status = ?record.status, "Duplicate idempotency key");
                Ok(BeginOutcome::Duplicate {
                    status: record.status,
                    result_hash: record.result_hash,
                })
            }
            // The holder expired between our set_if_absent and get. Rare;
            // treat as a duplicate of an unknown pending request rather than
            // racing a second begin.
            None => Ok(BeginOutcome::Duplicate {
                status: RecordStatus::Pending,
                result_hash: None,
            }),
        }
    }

    /// Transition `pending → completed`, storing the result hash.
    ///
    /// Completion failures are logged, not fatal: the response has already
    /// been produced, and the pending TTL bounds the damage.
    pub async fn complete(&self, key: &str, tenant_id: &str, result_hash: &str) {
        let store_key = Self::record_key(key, tenant_id);
        let record = IdempotencyRecord {
            status: RecordStatus::Completed,
            result_hash: Some(result_hash.to_string()),
            created_at: unix_now_secs(),
        };

        let Ok(serialized) = serde_json::to_string(&record) else {
            warn!(key, tenant_id, "Failed to serialize completed idempotency record");
            return;
        };

        if let Err(e) = self
            .store
            .set(&store_key, &serialized, Some(self.completed_ttl))
            .await
        {
            warn!(key, tenant_id, error = %e, "Failed to mark idempotency record completed");
        }
    }
}

fn unix_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
