//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible
//! defaults for development. In production, configure via environment
//! variables or a `.env` file.
//!
//! # Security Configuration
//!
//! - `WEBHOOK_SECRET`: Shared secret for webhook signature verification.
//!   When unset, signed-webhook routes reject every request.
//! - `CORS_ALLOWED_ORIGINS`: Comma-separated list of allowed origins
//!   (default: `*` for dev)
//!
//! # Rate Limiting
//!
//! Each limiter class carries its own limit and window:
//!
//! - `RATE_LIMIT_API_PER_MIN` (default: 100)
//! - `RATE_LIMIT_WEBHOOK_PER_MIN` (default: 50)
//! - `RATE_LIMIT_TENANT_PER_HOUR` (default: 10000)
//! - `RATE_LIMIT_BURST_PER_10S` (default: 20)
//!
//! Set any limit to 0 to disable that class.

use std::env;
use std::time::Duration;

use crate::error::{MiddlewareError, MiddlewareResult};
use crate::limiter::{Algorithm, ClassConfig, FailurePolicy, LimiterClass};
use crate::slo::SloThresholds;

/// How the pipeline answers when one of its own checks fails internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalErrorPolicy {
    /// Admit the request and log the failure.
    FailOpen,
    /// Reject the request with 500.
    FailClosed,
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Per-tenant API request limit per minute (0 = disabled)
    pub rate_limit_api_per_min: u32,

    /// Per-tenant webhook delivery limit per minute (0 = disabled)
    pub rate_limit_webhook_per_min: u32,

    /// Per-tenant aggregate limit per hour (0 = disabled)
    pub rate_limit_tenant_per_hour: u32,

    /// Per-tenant burst limit per 10-second window (0 = disabled)
    pub rate_limit_burst_per_10s: u32,

    // =========================================================================
    // Webhook Signature Configuration
    // =========================================================================
    /// Shared secret for webhook signature verification (optional)
    pub webhook_secret: Option<String>,

    /// Replay window: signatures with timestamps further from now than this
    /// are rejected (default: 300 seconds)
    pub signature_replay_window: Duration,

    // =========================================================================
    // Idempotency Configuration
    // =========================================================================
    /// TTL for pending idempotency records; bounds how long a crashed
    /// request blocks retries (default: 60 seconds)
    pub idempotency_pending_ttl: Duration,

    /// TTL for completed idempotency records; the retry-dedup horizon
    /// (default: 24 hours)
    pub idempotency_completed_ttl: Duration,

    // =========================================================================
    // SLO Monitoring Configuration
    // =========================================================================
    /// Sample buffer capacity (default: 10000)
    pub slo_buffer_capacity: usize,

    /// p95 ceiling for read-path requests, milliseconds (default: 250)
    pub slo_read_p95_ms: u64,

    /// p95 ceiling for write-path requests, milliseconds (default: 500)
    pub slo_write_p95_ms: u64,

    // =========================================================================
    // Context Registry Configuration
    // =========================================================================
    /// Maximum live request contexts (default: 10000)
    pub context_capacity: usize,

    /// How long a context stays resolvable after registration
    /// (default: 300 seconds)
    pub context_ttl: Duration,

    // =========================================================================
    // Isolation Audit Configuration
    // =========================================================================
    /// Maximum retained violation records (default: 1000)
    pub violation_log_capacity: usize,

    // =========================================================================
    // Alerting Configuration
    // =========================================================================
    /// Webhook URL for alert delivery (optional; alerts log locally when unset)
    pub alert_webhook_url: Option<String>,

    /// Timeout for a single alert delivery attempt (default: 5 seconds)
    pub alert_timeout: Duration,

    // =========================================================================
    // Pipeline Configuration
    // =========================================================================
    /// Behavior when a pipeline check itself fails internally.
    /// Values: "open", "closed" (default: "closed")
    pub internal_error_policy: InternalErrorPolicy,

    // =========================================================================
    // Security Configuration
    // =========================================================================
    /// Comma-separated list of allowed CORS origins
    /// Use "*" to allow all origins (not recommended for production)
    pub cors_allowed_origins: Vec<String>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Interval for background sweeps of expired store entries and
    /// contexts (default: 30 seconds)
    pub sweep_interval: Duration,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `MiddlewareError::ConfigError` if any value fails to parse
    /// or validation rejects the combination.
    pub fn from_env() -> MiddlewareResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 3000)?,

            // Rate limiting
            rate_limit_api_per_min: Self::parse_env("RATE_LIMIT_API_PER_MIN", 100)?,
            rate_limit_webhook_per_min: Self::parse_env("RATE_LIMIT_WEBHOOK_PER_MIN", 50)?,
            rate_limit_tenant_per_hour: Self::parse_env("RATE_LIMIT_TENANT_PER_HOUR", 10_000)?,
            rate_limit_burst_per_10s: Self::parse_env("RATE_LIMIT_BURST_PER_10S", 20)?,

            // Webhook signatures
            webhook_secret: env::var("WEBHOOK_SECRET").ok().filter(|s| !s.is_empty()),
            signature_replay_window: Duration::from_secs(Self::parse_env(
                "SIGNATURE_REPLAY_WINDOW_SECS",
                300,
            )?),

            // Idempotency
            idempotency_pending_ttl: Duration::from_secs(Self::parse_env(
                "IDEMPOTENCY_PENDING_TTL_SECS",
                60,
            )?),
            idempotency_completed_ttl: Duration::from_secs(Self::parse_env(
                "IDEMPOTENCY_COMPLETED_TTL_SECS",
                24 * 3600,
            )?),

            // SLO monitoring
            slo_buffer_capacity: Self::parse_env("SLO_BUFFER_CAPACITY", 10_000)?,
            slo_read_p95_ms: Self::parse_env("SLO_READ_P95_MS", 250)?,
            slo_write_p95_ms: Self::parse_env("SLO_WRITE_P95_MS", 500)?,

            // Context registry
            context_capacity: Self::parse_env("CONTEXT_CAPACITY", 10_000)?,
            context_ttl: Duration::from_secs(Self::parse_env("CONTEXT_TTL_SECS", 300)?),

            // Isolation audit
            violation_log_capacity: Self::parse_env("VIOLATION_LOG_CAPACITY", 1000)?,

            // Alerting
            alert_webhook_url: env::var("ALERT_WEBHOOK_URL").ok().filter(|s| !s.is_empty()),
            alert_timeout: Duration::from_secs(Self::parse_env("ALERT_TIMEOUT_SECS", 5)?),

            // Pipeline
            internal_error_policy: Self::parse_internal_error_policy()?,

            // Security
            cors_allowed_origins: Self::parse_cors_origins(),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            sweep_interval: Duration::from_secs(Self::parse_env("SWEEP_INTERVAL_SECS", 30)?),
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `MiddlewareError::ConfigError` if validation fails.
    fn validate(&self) -> MiddlewareResult<()> {
        if self.signature_replay_window.is_zero() {
            return Err(MiddlewareError::ConfigError(
                "SIGNATURE_REPLAY_WINDOW_SECS must be greater than 0".to_string(),
            ));
        }

        if self.idempotency_pending_ttl > self.idempotency_completed_ttl {
            return Err(MiddlewareError::ConfigError(format!(
                "IDEMPOTENCY_PENDING_TTL_SECS ({:?}) must be <= IDEMPOTENCY_COMPLETED_TTL_SECS ({:?})",
                self.idempotency_pending_ttl, self.idempotency_completed_ttl
            )));
        }

        if self.slo_buffer_capacity == 0 {
            return Err(MiddlewareError::ConfigError(
                "SLO_BUFFER_CAPACITY must be greater than 0".to_string(),
            ));
        }

        if self.context_capacity == 0 {
            return Err(MiddlewareError::ConfigError(
                "CONTEXT_CAPACITY must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Limiter class table derived from the configured limits.
    ///
    /// Classes with a limit of 0 are omitted, which makes them no-ops in
    /// the limiter bank. API and burst classes fail open on store trouble;
    /// webhook and tenant classes fail closed.
    pub fn limiter_classes(&self) -> Vec<(LimiterClass, ClassConfig)> {
        let mut classes = Vec::new();
        if self.rate_limit_api_per_min > 0 {
            classes.push((
                LimiterClass::Api,
                ClassConfig {
                    limit: self.rate_limit_api_per_min,
                    window: Duration::from_secs(60),
                    algorithm: Algorithm::FixedWindow,
                    failure_policy: FailurePolicy::Open,
                },
            ));
        }
        if self.rate_limit_webhook_per_min > 0 {
            classes.push((
                LimiterClass::Webhook,
                ClassConfig {
                    limit: self.rate_limit_webhook_per_min,
                    window: Duration::from_secs(60),
                    algorithm: Algorithm::FixedWindow,
                    failure_policy: FailurePolicy::Closed,
                },
            ));
        }
        if self.rate_limit_tenant_per_hour > 0 {
            classes.push((
                LimiterClass::Tenant,
                ClassConfig {
                    limit: self.rate_limit_tenant_per_hour,
                    window: Duration::from_secs(3600),
                    algorithm: Algorithm::FixedWindow,
                    failure_policy: FailurePolicy::Closed,
                },
            ));
        }
        if self.rate_limit_burst_per_10s > 0 {
            classes.push((
                LimiterClass::Burst,
                ClassConfig {
                    limit: self.rate_limit_burst_per_10s,
                    window: Duration::from_secs(10),
                    algorithm: Algorithm::TokenBucket,
                    failure_policy: FailurePolicy::Open,
                },
            ));
        }
        classes
    }

    /// SLO thresholds derived from the configured ceilings.
    pub fn slo_thresholds(&self) -> SloThresholds {
        SloThresholds {
            read_p95_ms: self.slo_read_p95_ms,
            write_p95_ms: self.slo_write_p95_ms,
            ..SloThresholds::default()
        }
    }

    /// Check if webhook signature verification is configured.
    pub fn signatures_enabled(&self) -> bool {
        self.webhook_secret.is_some()
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> MiddlewareResult<T>
    where
        T: std::str::FromStr + ToString,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .parse()
                .map_err(|e| MiddlewareError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    fn parse_internal_error_policy() -> MiddlewareResult<InternalErrorPolicy> {
        match env::var("INTERNAL_ERROR_POLICY") {
            Ok(val) => match val.to_lowercase().as_str() {
                "open" => Ok(InternalErrorPolicy::FailOpen),
                "closed" => Ok(InternalErrorPolicy::FailClosed),
                other => Err(MiddlewareError::ConfigError(format!(
                    "Invalid INTERNAL_ERROR_POLICY '{other}': expected 'open' or 'closed'"
                ))),
            },
            Err(_) => Ok(InternalErrorPolicy::FailClosed),
        }
    }

    /// Parse CORS allowed origins from environment variable.
    fn parse_cors_origins() -> Vec<String> {
        env::var("CORS_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 3000,
            // Rate limiting
            rate_limit_api_per_min: 100,
            rate_limit_webhook_per_min: 50,
            rate_limit_tenant_per_hour: 10_000,
            rate_limit_burst_per_10s: 20,
            // Webhook signatures
            webhook_secret: None,
            signature_replay_window: Duration::from_secs(300),
            // Idempotency
            idempotency_pending_ttl: Duration::from_secs(60),
            idempotency_completed_ttl: Duration::from_secs(24 * 3600),
            // SLO monitoring
            slo_buffer_capacity: 10_000,
            slo_read_p95_ms: 250,
            slo_write_p95_ms: 500,
            // Context registry
            context_capacity: 10_000,
            context_ttl: Duration::from_secs(300),
            // Isolation audit
            violation_log_capacity: 1000,
            // Alerting
            alert_webhook_url: None,
            alert_timeout: Duration::from_secs(5),
            // Pipeline
            internal_error_policy: InternalErrorPolicy::FailClosed,
            // Security
            cors_allowed_origins: vec!["*".to_string()],
            // Observability
            log_level: "info".to_string(),
            sweep_interval: Duration::from_secs(30),
            metrics_port: 9090,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.rate_limit_api_per_min, 100);
        assert_eq!(config.internal_error_policy, InternalErrorPolicy::FailClosed);
        assert!(config.webhook_secret.is_none());
        assert!(!config.signatures_enabled());
    }

    #[test]
    fn test_server_addr_format() {
        let config = Config {
            host: "localhost".to_string(),
            port: 3000,
            ..Config::default()
        };

        assert_eq!(config.server_addr(), "localhost:3000");
    }

    #[test]
    fn test_limiter_classes_cover_all_enabled() {
        let config = Config::default();
        let classes = config.limiter_classes();
        assert_eq!(classes.len(), 4);

        let api = classes
            .iter()
            .find(|(c, _)| *c == LimiterClass::Api)
            .map(|(_, cfg)| cfg)
            .unwrap();
        assert_eq!(api.limit, 100);
        assert_eq!(api.window, Duration::from_secs(60));
        assert_eq!(api.failure_policy, FailurePolicy::Open);

        let webhook = classes
            .iter()
            .find(|(c, _)| *c == LimiterClass::Webhook)
            .map(|(_, cfg)| cfg)
            .unwrap();
        assert_eq!(webhook.failure_policy, FailurePolicy::Closed);

        let burst = classes
            .iter()
            .find(|(c, _)| *c == LimiterClass::Burst)
            .map(|(_, cfg)| cfg)
            .unwrap();
        assert_eq!(burst.algorithm, Algorithm::TokenBucket);
    }

    #[test]
    fn test_zero_limit_disables_class() {
        let config = Config {
            rate_limit_burst_per_10s: 0,
            ..Config::default()
        };
        let classes = config.limiter_classes();
        assert!(classes.iter().all(|(c, _)| *c != LimiterClass::Burst));
        assert_eq!(classes.len(), 3);
    }

    #[test]
    fn test_validate_ttl_ordering() {
        let config = Config {
            idempotency_pending_ttl: Duration::from_secs(48 * 3600),
            ..Config::default()
        };

        let result = config.validate();
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("IDEMPOTENCY_PENDING_TTL_SECS")
        );
    }

    #[test]
    fn test_validate_zero_buffer_capacity() {
        let config = Config {
            slo_buffer_capacity: 0,
            ..Config::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_valid_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_metrics_addr() {
        let config = Config::default();
        assert!(config.metrics_addr().is_some());

        let config = Config {
            metrics_port: 0,
            ..Config::default()
        };
        assert!(config.metrics_addr().is_none());
    }
}
