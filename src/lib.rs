//! # Tenantguard
//!
//! Request reliability and tenant-isolation middleware for multi-tenant
//! HTTP APIs, featuring:
//!
//! - **Rate limiting**: per-tenant limiter classes over a shared store
//! - **Idempotency**: atomic key claims for safe request retries
//! - **Webhook security**: HMAC payload signatures with replay protection
//! - **Isolation**: cross-tenant access detection with an audit trail
//! - **SLO monitoring**: streaming latency/error objectives with alerts
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Pipeline (Auth → Rate Limit → Signature → Idempotency →    │
//! │            Feature) + response headers + SLO sampling       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (leads, reports, webhooks, health, slo)           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Components (limiter bank, idempotency store, verifier,     │
//! │              isolation guard, SLO monitor, alerting)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  KeyValueStore (in-memory; swap in a networked store for    │
//! │                 multi-process deployments)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tenantguard::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config)?;
//!     let app = build_router(state);
//!
//!     // Start the server...
//!     Ok(())
//! }
//! ```
//!
//! ## Security Configuration
//!
//! Enable webhook signature verification:
//! ```bash
//! WEBHOOK_SECRET=your-shared-secret cargo run
//! ```
//!
//! Tune per-tenant rate limits:
//! ```bash
//! RATE_LIMIT_API_PER_MIN=100 RATE_LIMIT_BURST_PER_10S=20 cargo run
//! ```

pub mod alert;
pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod idempotency;
pub mod isolation;
pub mod limiter;
pub mod metrics;
pub mod middleware;
pub mod resolver;
pub mod routes;
pub mod signature;
pub mod slo;
pub mod state;
pub mod store;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use error::{MiddlewareError, MiddlewareResult};
pub use routes::build_router;
pub use state::AppState;
