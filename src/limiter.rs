//! Rate limiter bank with store-backed counters.
//!
//! # Algorithms
//!
//! Two algorithms implement the single [`RateLimiter`] capability and are
//! selected per class by configuration:
//!
//! - **Fixed window** ([`FixedWindowLimiter`]): one atomic counter per
//!   `(class, tenant, window)` key. Increment-and-read is atomic in the
//!   shared store, so concurrent handler processes can never both observe
//!   "under limit". This is the strict-ceiling algorithm.
//! - **Token bucket** ([`TokenBucketLimiter`]): continuous refill, smoother
//!   admission for bursty traffic. Its state update is read-modify-write in
//!   the store and may briefly over-admit under heavy contention; classes
//!   that need a hard ceiling use fixed window instead.
//!
//! # Tie-break
//!
//! The limiter is inclusive of the ceiling: the request that makes the
//! counter *reach* the limit is allowed, the next one is rejected.
//!
//! # Failure Policy
//!
//! When the shared store is unreachable, each class applies its configured
//! [`FailurePolicy`]. The default asymmetry is deliberate and named in
//! configuration: `webhook` and `tenant` fail closed (reject, protect the
//! backend), `api` and `burst` fail open (admit, preserve availability).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, warn};

use crate::error::{MiddlewareError, MiddlewareResult};
use crate::store::{KeyValueStore, StoreError};

/// Named limiter classes, each independently configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterClass {
    /// General API traffic.
    Api,
    /// Inbound webhook deliveries.
    Webhook,
    /// Per-tenant aggregate ceiling.
    Tenant,
    /// Short-window burst damping.
    Burst,
}

impl LimiterClass {
    /// Stable identifier used in store keys, metrics labels, and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            LimiterClass::Api => "api",
            LimiterClass::Webhook => "webhook",
            LimiterClass::Tenant => "tenant",
            LimiterClass::Burst => "burst",
        }
    }
}

impl fmt::Display for LimiterClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Behavior when the shared store is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Admit the request (availability over strictness).
    Open,
    /// Reject the request (protect the backend).
    Closed,
}

/// Limiting algorithm for a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    FixedWindow,
    TokenBucket,
}

/// Per-class limiter configuration.
#[derive(Debug, Clone)]
pub struct ClassConfig {
    /// Request ceiling per window (fixed window) or bucket capacity (token bucket).
    pub limit: u32,
    /// Window length; also the token bucket's full-refill interval.
    pub window: Duration,
    pub algorithm: Algorithm,
    pub failure_policy: FailurePolicy,
}

/// Outcome of a limiter check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Configured ceiling for the class.
    pub limit: u32,
    /// Requests left in the current window (0 when rejected).
    pub remaining: u32,
    /// Unix seconds when the window resets / a token is next available.
    pub reset_time: u64,
    /// Seconds until a retry can succeed; set only on rejection.
    pub retry_after: Option<u64>,
}

/// The single rate-limiting capability all algorithms implement.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Consume one unit of quota for `tenant_id` and report the decision.
    async fn check(&self, tenant_id: &str) -> Result<RateLimitDecision, StoreError>;
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn unix_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// =============================================================================
// Fixed Window
// =============================================================================

/// Fixed-window limiter over an atomic store counter.
///
/// The counter key embeds the window start, so a new window naturally begins
/// at a fresh count and old windows age out via TTL.
pub struct FixedWindowLimiter {
    store: Arc<dyn KeyValueStore>,
    class: LimiterClass,
    limit: u32,
    window: Duration,
}

impl FixedWindowLimiter {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        class: LimiterClass,
        limit: u32,
        window: Duration,
    ) -> Self {
        Self {
            store,
            class,
            limit,
            window,
        }
    }

    /// Check against an explicit clock. Separated from [`RateLimiter::check`]
    /// so window-boundary behavior is deterministic in tests.
    pub async fn check_at(
        &self,
        tenant_id: &str,
        now_secs: u64,
    ) -> Result<RateLimitDecision, StoreError> {
        let window_secs = self.window.as_secs().max(1);
        let window_start = now_secs - (now_secs % window_secs);
        let reset_time = window_start + window_secs;

        let key = format!(
            "rl:{}:{}:{}",
            self.class.as_str(),
            tenant_id,
            window_start
        );

        // Keep the counter around a full extra window so late stragglers in
        // a closing window still see it; the key is never reused after that.
        let ttl = Some(self.window.saturating_mul(2));
        let count = self.store.incr_atomic(&key, ttl).await?;

        // Inclusive ceiling: the hit that reaches `limit` is still admitted.
        let allowed = count <= u64::from(self.limit);
        let remaining = u64::from(self.limit).saturating_sub(count) as u32;

        Ok(RateLimitDecision {
            allowed,
            limit: self.limit,
            remaining,
            reset_time,
            retry_after: if allowed {
                None
            } else {
                Some((reset_time - now_secs).max(1))
            },
        })
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn check(&self, tenant_id: &str) -> Result<RateLimitDecision, StoreError> {
        self.check_at(tenant_id, unix_now_secs()).await
    }
}

// =============================================================================
// Token Bucket
// =============================================================================

/// Token-bucket limiter with store-persisted bucket state.
///
/// State is serialized as `"{tokens}:{last_refill_ms}"`. The update is
/// read-modify-write rather than atomic; under contention two writers can
/// race and admit marginally above the configured rate. Acceptable for the
/// burst-damping class, not for strict ceilings.
pub struct TokenBucketLimiter {
    store: Arc<dyn KeyValueStore>,
    class: LimiterClass,
    capacity: u32,
    /// Tokens refilled per millisecond.
    refill_per_ms: f64,
    window: Duration,
}

impl TokenBucketLimiter {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        class: LimiterClass,
        capacity: u32,
        window: Duration,
    ) -> Self {
        let window_ms = window.as_millis().max(1) as f64;
        Self {
            store,
            class,
            capacity,
            refill_per_ms: f64::from(capacity) / window_ms,
            window,
        }
    }

    /// Check against an explicit clock, in milliseconds since the epoch.
    pub async fn check_at(
        &self,
        tenant_id: &str,
        now_ms: u64,
    ) -> Result<RateLimitDecision, StoreError> {
        let key = format!("tb:{}:{}", self.class.as_str(), tenant_id);

        let (mut tokens, last_ms) = match self.store.get(&key).await? {
            Some(raw) => parse_bucket_state(&raw)
                .ok_or_else(|| StoreError::Corrupt(format!("bad bucket state at {key}")))?,
            None => (f64::from(self.capacity), now_ms),
        };

        let elapsed_ms = now_ms.saturating_sub(last_ms) as f64;
        tokens = (tokens + elapsed_ms * self.refill_per_ms).min(f64::from(self.capacity));

        let allowed = tokens >= 1.0;
        if allowed {
            tokens -= 1.0;
        }

        let state = format!("{tokens}:{now_ms}");
        self.store
            .set(&key, &state, Some(self.window.saturating_mul(2)))
            .await?;

        let retry_after = if allowed {
            None
        } else {
            // Time until a whole token is available again.
            let deficit = 1.0 - tokens;
            let wait_ms = (deficit / self.refill_per_ms).ceil();
            Some(((wait_ms / 1000.0).ceil() as u64).max(1))
        };

        Ok(RateLimitDecision {
            allowed,
            limit: self.capacity,
            remaining: tokens.floor().max(0.0) as u32,
            reset_time: now_ms / 1000 + retry_after.unwrap_or(0),
            retry_after,
        })
    }
}

fn parse_bucket_state(raw: &str) -> Option<(f64, u64)> {
    let (tokens, last) = raw.split_once(':')?;
    Some((tokens.parse().ok()?, last.parse().ok()?))
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn check(&self, tenant_id: &str) -> Result<RateLimitDecision, StoreError> {
        self.check_at(tenant_id, unix_now_millis()).await
    }
}

// =============================================================================
// Bank
// =============================================================================

/// Named limiter classes dispatching to configured algorithm instances.
///
/// The bank owns the failure-policy handling: store errors never escape to
/// the pipeline as raw `StoreError`s, they resolve into an admit or a reject
/// according to the class policy.
pub struct RateLimiterBank {
    limiters: HashMap<LimiterClass, (ClassConfig, Box<dyn RateLimiter>)>,
}

impl RateLimiterBank {
    /// Build the bank from per-class configuration over a shared store.
    pub fn new(store: Arc<dyn KeyValueStore>, classes: &[(LimiterClass, ClassConfig)]) -> Self {
        let mut limiters: HashMap<LimiterClass, (ClassConfig, Box<dyn RateLimiter>)> =
            HashMap::new();

        for (class, config) in classes {
            let limiter: Box<dyn RateLimiter> = match config.algorithm {
                Algorithm::FixedWindow => Box::new(FixedWindowLimiter::new(
                    store.clone(),
                    *class,
                    config.limit,
                    config.window,
                )),
                Algorithm::TokenBucket => Box::new(TokenBucketLimiter::new(
                    store.clone(),
                    *class,
                    config.limit,
                    config.window,
                )),
            };
            limiters.insert(*class, (config.clone(), limiter));
        }

        Self { limiters }
    }

    /// Check one unit of quota for `tenant_id` under `class`.
    ///
    /// # Errors
    ///
    /// - `RateLimitExceeded` when the quota is exhausted, or when the store
    ///   is unreachable and the class fails closed.
    /// - Never a raw store error: fail-open classes admit on store failure.
    pub async fn check(
        &self,
        class: LimiterClass,
        tenant_id: &str,
    ) -> MiddlewareResult<RateLimitDecision> {
        let Some((config, limiter)) = self.limiters.get(&class) else {
            // Unconfigured class: nothing to enforce.
            return Ok(RateLimitDecision {
                allowed: true,
                limit: 0,
                remaining: 0,
                reset_time: unix_now_secs(),
                retry_after: None,
            });
        };

        match limiter.check(tenant_id).await {
            Ok(decision) => {
                crate::metrics::set_store_failure_mode(false);
                if !decision.allowed {
                    crate::metrics::record_rate_limit_rejection(class.as_str());
                    warn!(
                        class = class.as_str(),
                        tenant_id,
                        retry_after = decision.retry_after,
                        "Rate limit exceeded"
                    );
                    return Err(MiddlewareError::RateLimitExceeded {
                        retry_after: decision.retry_after.unwrap_or(1),
                        limit: decision.limit,
                        reset_time: decision.reset_time,
                    });
                }
                Ok(decision)
            }
            Err(store_err) => {
                crate::metrics::set_store_failure_mode(true);
                match config.failure_policy {
                    FailurePolicy::Open => {
                        warn!(
                            class = class.as_str(),
                            tenant_id,
                            error = %store_err,
                            "Limiter store unavailable, failing open"
                        );
                        Ok(RateLimitDecision {
                            allowed: true,
                            limit: config.limit,
                            remaining: config.limit,
                            reset_time: unix_now_secs() + config.window.as_secs(),
                            retry_after: None,
                        })
                    }
                    FailurePolicy::Closed => {
                        error!(
                            class = class.as_str(),
                            tenant_id,
                            error = %store_err,
                            "Limiter store unavailable, failing closed"
                        );
                        Err(MiddlewareError::RateLimitExceeded {
                            retry_after: config.window.as_secs().max(1),
                            limit: config.limit,
                            reset_time: unix_now_secs() + config.window.as_secs(),
                        })
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn memory_store() -> Arc<dyn KeyValueStore> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn test_fixed_window_admits_exactly_limit() {
        let limiter = FixedWindowLimiter::new(
            memory_store(),
            LimiterClass::Api,
            100,
            Duration::from_secs(60),
        );

        let now = 1_700_000_040; // mid-window
        for i in 1..=100 {
            let decision = limiter.check_at("tenant-a", now).await.unwrap();
            assert!(decision.allowed, "request {i} should be admitted");
        }

        let rejected = limiter.check_at("tenant-a", now).await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert!(rejected.retry_after.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_fixed_window_reaching_limit_is_allowed() {
        let limiter = FixedWindowLimiter::new(
            memory_store(),
            LimiterClass::Api,
            3,
            Duration::from_secs(60),
        );

        let now = 1_700_000_000;
        limiter.check_at("t", now).await.unwrap();
        limiter.check_at("t", now).await.unwrap();
        // The hit that reaches the ceiling is still allowed...
        let at_limit = limiter.check_at("t", now).await.unwrap();
        assert!(at_limit.allowed);
        assert_eq!(at_limit.remaining, 0);
        // ...and the next one is not.
        assert!(!limiter.check_at("t", now).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_fixed_window_resets_at_boundary() {
        let limiter = FixedWindowLimiter::new(
            memory_store(),
            LimiterClass::Api,
            2,
            Duration::from_secs(60),
        );

        let now = 1_700_000_000;
        limiter.check_at("t", now).await.unwrap();
        limiter.check_at("t", now).await.unwrap();
        assert!(!limiter.check_at("t", now).await.unwrap().allowed);

        // Next window admits again.
        let next_window = now + 60;
        assert!(limiter.check_at("t", next_window).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_fixed_window_tenants_are_independent() {
        let limiter = FixedWindowLimiter::new(
            memory_store(),
            LimiterClass::Api,
            1,
            Duration::from_secs(60),
        );

        let now = 1_700_000_000;
        assert!(limiter.check_at("tenant-a", now).await.unwrap().allowed);
        assert!(limiter.check_at("tenant-b", now).await.unwrap().allowed);
        assert!(!limiter.check_at("tenant-a", now).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_token_bucket_drains_and_refills() {
        let limiter = TokenBucketLimiter::new(
            memory_store(),
            LimiterClass::Burst,
            10,
            Duration::from_secs(10), // 1 token per second
        );

        let now = 1_700_000_000_000u64;
        for _ in 0..10 {
            assert!(limiter.check_at("t", now).await.unwrap().allowed);
        }
        let rejected = limiter.check_at("t", now).await.unwrap();
        assert!(!rejected.allowed);
        assert!(rejected.retry_after.unwrap() >= 1);

        // One second later a token has refilled.
        assert!(limiter.check_at("t", now + 1_000).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_token_bucket_caps_at_capacity() {
        let limiter = TokenBucketLimiter::new(
            memory_store(),
            LimiterClass::Burst,
            5,
            Duration::from_secs(5),
        );

        let now = 1_700_000_000_000u64;
        limiter.check_at("t", now).await.unwrap();
        // A long idle period must not bank more than `capacity` tokens.
        let much_later = now + 3_600_000;
        for _ in 0..5 {
            assert!(limiter.check_at("t", much_later).await.unwrap().allowed);
        }
        assert!(!limiter.check_at("t", much_later).await.unwrap().allowed);
    }

    /// Store stub that always fails, for failure-policy tests.
    struct DownStore;

    #[async_trait]
    impl KeyValueStore for DownStore {
        async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn set(&self, _: &str, _: &str, _: Option<Duration>) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn set_if_absent(
            &self,
            _: &str,
            _: &str,
            _: Option<Duration>,
        ) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn incr_atomic(&self, _: &str, _: Option<Duration>) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn delete(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    fn bank_over(store: Arc<dyn KeyValueStore>) -> RateLimiterBank {
        RateLimiterBank::new(
            store,
            &[
                (
                    LimiterClass::Api,
                    ClassConfig {
                        limit: 100,
                        window: Duration::from_secs(60),
                        algorithm: Algorithm::FixedWindow,
                        failure_policy: FailurePolicy::Open,
                    },
                ),
                (
                    LimiterClass::Webhook,
                    ClassConfig {
                        limit: 50,
                        window: Duration::from_secs(60),
                        algorithm: Algorithm::FixedWindow,
                        failure_policy: FailurePolicy::Closed,
                    },
                ),
            ],
        )
    }

    #[tokio::test]
    async fn test_bank_fail_open_admits_on_store_failure() {
        let bank = bank_over(Arc::new(DownStore));
        let decision = bank.check(LimiterClass::Api, "t").await.unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_bank_fail_closed_rejects_on_store_failure() {
        let bank = bank_over(Arc::new(DownStore));
        let err = bank.check(LimiterClass::Webhook, "t").await.unwrap_err();
        assert!(matches!(
            err,
            MiddlewareError::RateLimitExceeded { retry_after, .. } if retry_after > 0
        ));
    }

    #[tokio::test]
    async fn test_bank_rejection_surfaces_retry_after() {
        let bank = bank_over(memory_store());
        for _ in 0..50 {
            bank.check(LimiterClass::Webhook, "t").await.unwrap();
        }
        let err = bank.check(LimiterClass::Webhook, "t").await.unwrap_err();
        assert!(matches!(
            err,
            MiddlewareError::RateLimitExceeded { retry_after, .. } if retry_after > 0
        ));
    }

    #[tokio::test]
    async fn test_bank_unconfigured_class_is_noop() {
        let bank = bank_over(memory_store());
        let decision = bank.check(LimiterClass::Burst, "t").await.unwrap();
        assert!(decision.allowed);
    }
}
