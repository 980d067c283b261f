//! Tenant-scoped business endpoints.
//!
//! These handlers run behind the full pipeline, so by the time they execute
//! the tenant is authenticated, within quota, and (for webhook routes)
//! signature-verified. The [`RequestContext`] arrives via request
//! extensions; its `tenant_id` is the only tenant the handler may touch,
//! and the isolation guard enforces that against the operation's target.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::context::RequestContext;
use crate::error::{MiddlewareError, MiddlewareResult};
use crate::state::AppState;

/// Body of `POST /v1/leads`.
#[derive(Debug, Deserialize)]
pub struct CreateLeadRequest {
    /// Tenant the lead belongs to. Defaults to the authenticated tenant;
    /// naming any other tenant is an isolation violation.
    pub tenant_id: Option<String>,
    pub name: String,
    pub source: String,
}

/// Body returned for a created lead.
#[derive(Debug, Serialize)]
pub struct LeadResponse {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

/// Create a lead for the authenticated tenant.
#[instrument(skip(state, ctx, body), fields(tenant_id = %ctx.tenant_id))]
pub async fn create_lead(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<CreateLeadRequest>,
) -> MiddlewareResult<(StatusCode, Json<LeadResponse>)> {
    let target_tenant = body.tenant_id.unwrap_or_else(|| ctx.tenant_id.clone());

    if !state.guard.validate_tenant_access(&ctx.id, &target_tenant).await {
        return Err(MiddlewareError::TenantAccessDenied);
    }

    if body.name.trim().is_empty() {
        return Err(MiddlewareError::BadRequest(
            "lead name must not be empty".to_string(),
        ));
    }

    let lead = LeadResponse {
        id: Uuid::new_v4().to_string(),
        tenant_id: target_tenant,
        name: body.name,
        source: body.source,
        created_at: Utc::now(),
    };
    info!(lead_id = %lead.id, "Lead created");

    Ok((StatusCode::CREATED, Json(lead)))
}

/// Query parameters for `GET /v1/reports`.
#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    /// Optional raw filter expression, screened by the isolation guard.
    pub filter: Option<String>,
}

/// Body of `GET /v1/reports`.
#[derive(Debug, Serialize)]
pub struct ReportResponse {
    pub tenant_id: String,
    pub request_id: String,
    pub filter: Option<String>,
    pub generated_at: DateTime<Utc>,
}

/// Generate a marketing report for the authenticated tenant.
#[instrument(skip(state, ctx), fields(tenant_id = %ctx.tenant_id))]
pub async fn get_report(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    axum::extract::Query(query): axum::extract::Query<ReportQuery>,
) -> MiddlewareResult<Json<ReportResponse>> {
    if let Some(filter) = &query.filter
        && !state
            .guard
            .validate_query_execution(&ctx.id, &ctx.tenant_id, filter)
            .await
    {
        return Err(MiddlewareError::BadRequest(
            "filter expression rejected".to_string(),
        ));
    }

    Ok(Json(ReportResponse {
        tenant_id: ctx.tenant_id.clone(),
        request_id: ctx.id.clone(),
        filter: query.filter,
        generated_at: Utc::now(),
    }))
}

/// Body returned for an accepted webhook delivery.
#[derive(Debug, Serialize)]
pub struct WebhookAccepted {
    pub accepted: bool,
    pub source: String,
    pub request_id: String,
}

/// Accept a signed webhook delivery.
///
/// The pipeline has already verified the payload signature and consumed
/// webhook-class quota; this handler only acknowledges receipt.
#[instrument(skip(ctx, _body), fields(tenant_id = %ctx.tenant_id))]
pub async fn receive_webhook(
    Path(source): Path<String>,
    Extension(ctx): Extension<RequestContext>,
    _body: axum::body::Bytes,
) -> (StatusCode, Json<WebhookAccepted>) {
    info!(source = %source, "Webhook accepted");
    (
        StatusCode::ACCEPTED,
        Json(WebhookAccepted {
            accepted: true,
            source,
            request_id: ctx.id,
        }),
    )
}
