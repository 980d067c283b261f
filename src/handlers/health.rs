//! Health and readiness endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check with component counters
//! - `GET /ready` - Kubernetes-compatible readiness probe
//!
//! # Health vs Readiness
//!
//! - **Health** (`/health`): always 200, with detail in the body
//! - **Readiness** (`/ready`): 200 once the state is constructed; this
//!   service has no external dependency to wait on

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;

use crate::state::AppState;

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    /// Whether webhook signature verification is configured.
    pub signatures_configured: bool,
    /// Live entries in the shared store.
    pub store_entries: usize,
    /// Registered request contexts.
    pub active_contexts: usize,
    pub timestamp: DateTime<Utc>,
}

/// Health check endpoint.
///
/// Always returns 200 OK with component detail in the body.
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        signatures_configured: state.verifier.is_configured(),
        store_entries: state.store.len().await,
        active_contexts: state.registry.len().await,
        timestamp: Utc::now(),
    })
}

/// Readiness check endpoint for Kubernetes probes.
#[instrument(skip_all)]
pub async fn readiness_check() -> StatusCode {
    StatusCode::OK
}
