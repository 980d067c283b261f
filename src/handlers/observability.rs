//! SLO reporting and violation audit endpoints.
//!
//! # Endpoints
//!
//! - `GET /slo/report?endpoint=/v1/leads&window=1h` - Point-in-time SLO report
//! - `GET /violations` - Recorded tenant isolation violations, oldest first
//!
//! These are operator endpoints: they sit outside the tenant pipeline and
//! read monitor state without mutating it.

use axum::Json;
use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::{MiddlewareError, MiddlewareResult};
use crate::isolation::TenantViolation;
use crate::slo::{SloReport, SloWindow};
use crate::state::AppState;

/// Query parameters for `GET /slo/report`.
#[derive(Debug, Deserialize)]
pub struct SloReportQuery {
    /// Endpoint path the report covers.
    pub endpoint: String,
    /// Reporting window: `1h`, `24h`, or `7d`. Defaults to `1h`.
    pub window: Option<String>,
}

/// Generate an SLO report for one endpoint over a window.
#[instrument(skip(state))]
pub async fn slo_report(
    State(state): State<AppState>,
    Query(query): Query<SloReportQuery>,
) -> MiddlewareResult<Json<SloReport>> {
    let window = match query.window.as_deref() {
        None => SloWindow::Hour,
        Some(raw) => SloWindow::parse(raw).ok_or_else(|| {
            MiddlewareError::BadRequest(format!(
                "unknown window '{raw}': expected 1h, 24h, or 7d"
            ))
        })?,
    };

    Ok(Json(state.slo.report(&query.endpoint, window).await))
}

/// Body of `GET /violations`.
#[derive(Debug, Serialize)]
pub struct ViolationsResponse {
    pub count: usize,
    pub violations: Vec<TenantViolation>,
}

/// List recorded tenant isolation violations, oldest first.
#[instrument(skip(state))]
pub async fn list_violations(State(state): State<AppState>) -> Json<ViolationsResponse> {
    let violations = state.guard.violations().await;
    Json(ViolationsResponse {
        count: violations.len(),
        violations,
    })
}
