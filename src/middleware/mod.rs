//! HTTP middleware for tenant reliability and isolation.
//!
//! This module provides the request pipeline and its supporting pieces:
//!
//! - **Pipeline**: ordered reliability checks wrapping every business route
//! - **IP extraction**: client address recovery from forwarded headers
//!
//! # Architecture
//!
//! ```text
//! Request → Auth → Rate Limit → Signature → Idempotency → Feature → Handler
//!             ↓        ↓            ↓            ↓            ↓
//!           401      429 +        401          409          403
//!                  Retry-After
//! ```
//!
//! Checks run strictly in that order and short-circuit: a request rejected
//! by an earlier check never consumes quota or state in a later one. The
//! handler response is then annotated with rate-limit and timing headers
//! and fed to the SLO monitor.

pub mod ip;
pub mod pipeline;

pub use ip::{UNKNOWN_IP, extract_client_ip, extract_user_agent};
pub use pipeline::{
    IDEMPOTENCY_KEY_HEADER, PipelineComponents, PipelineConfig, RequestPipeline,
};
