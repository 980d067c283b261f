//! The ordered reliability pipeline.
//!
//! Every business route is wrapped by [`RequestPipeline`], which runs the
//! checks in a fixed order and stops at the first rejection:
//!
//! 1. **Auth**: resolve the tenant identity, build and register the
//!    request context.
//! 2. **Rate limit**: consume quota in the applicable limiter classes.
//! 3. **Signature**: verify the payload signature on webhook routes.
//! 4. **Idempotency**: claim the idempotency key when one is supplied.
//! 5. **Feature**: assert the tenant is entitled to feature-gated routes.
//!
//! The ordering is load-bearing: authentication happens before any quota is
//! consumed, and a rate-limited request never claims an idempotency key it
//! will not use.
//!
//! # Internal Errors
//!
//! Typed rejections (401/403/409/429) always reject. When a check itself
//! fails internally (a store error during idempotency claim), the configured
//! [`InternalErrorPolicy`] decides: fail-open admits the request without
//! that protection, fail-closed answers 500.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::config::InternalErrorPolicy;
use crate::context::{ContextRegistry, RequestContext};
use crate::error::MiddlewareError;
use crate::idempotency::{BeginOutcome, IdempotencyStore};
use crate::limiter::{LimiterClass, RateLimitDecision, RateLimiterBank};
use crate::resolver::{FeatureResolver, TenantResolver};
use crate::signature::{SIGNATURE_HEADER, SIGNATURE_TIMESTAMP_HEADER, SignatureVerifier};
use crate::slo::{MetricSample, SloMonitor};

/// Header carrying the client-chosen idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Largest webhook body the pipeline will buffer for signature verification.
const MAX_BUFFERED_BODY: usize = 2 * 1024 * 1024;

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
const X_PROCESSING_TIME: HeaderName = HeaderName::from_static("x-processing-time");
const SERVER_TIMING: HeaderName = HeaderName::from_static("server-timing");

/// Routing decisions the pipeline makes from the request path.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Paths under this prefix are webhook routes: they use the webhook
    /// limiter class and require a valid payload signature.
    pub webhook_path_prefix: String,
    /// Path-prefix to feature-name table for entitlement-gated routes.
    pub feature_routes: Vec<(String, String)>,
    pub internal_error_policy: InternalErrorPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            webhook_path_prefix: "/webhooks".to_string(),
            feature_routes: Vec::new(),
            internal_error_policy: InternalErrorPolicy::FailClosed,
        }
    }
}

/// Shared collaborators the pipeline drives.
pub struct PipelineComponents {
    pub resolver: Arc<dyn TenantResolver>,
    pub features: Arc<dyn FeatureResolver>,
    pub bank: Arc<RateLimiterBank>,
    pub verifier: SignatureVerifier,
    pub idempotency: IdempotencyStore,
    pub registry: Arc<ContextRegistry>,
    pub slo: SloMonitor,
    pub config: PipelineConfig,
}

/// Tower layer applying the reliability pipeline to a route tree.
#[derive(Clone)]
pub struct RequestPipeline {
    components: Arc<PipelineComponents>,
}

impl RequestPipeline {
    pub fn new(components: Arc<PipelineComponents>) -> Self {
        Self { components }
    }
}

impl<S> Layer<S> for RequestPipeline {
    type Service = RequestPipelineService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestPipelineService {
            inner,
            components: self.components.clone(),
        }
    }
}

/// Service wrapper executing the checks around the inner handler.
#[derive(Clone)]
pub struct RequestPipelineService<S> {
    inner: S,
    components: Arc<PipelineComponents>,
}

impl<S> Service<Request<Body>> for RequestPipelineService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let components = self.components.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let start = Instant::now();
            let method = req.method().to_string();
            let path = req.uri().path().to_string();

            let checks = run_checks(&components, req).await;
            let overhead = start.elapsed();
            crate::metrics::record_pipeline_overhead(overhead.as_secs_f64());

            let (mut response, artifacts) = match checks {
                Ok((req, artifacts)) => (inner.call(req).await?, Some(artifacts)),
                Err(err) => (err.into_response(), None),
            };

            if let Some(artifacts) = &artifacts {
                // The response exists regardless of whether this write lands;
                // completion failures only shorten the dedup horizon.
                if let Some((key, tenant_id)) = &artifacts.idempotency_claim {
                    let hash = result_hash(response.status().as_u16());
                    components.idempotency.complete(key, tenant_id, &hash).await;
                }

                if let Some(decision) = &artifacts.decision {
                    apply_rate_limit_headers(&mut response, decision);
                }
            }

            let total = start.elapsed();
            apply_timing_headers(&mut response, overhead.as_secs_f64(), total.as_secs_f64());

            components
                .slo
                .record(MetricSample {
                    endpoint: path,
                    method,
                    duration_ms: total.as_millis() as u64,
                    status_code: response.status().as_u16(),
                    timestamp: Utc::now(),
                    error: response
                        .status()
                        .is_server_error()
                        .then(|| response.status().to_string()),
                })
                .await;

            Ok(response)
        })
    }
}

/// What the checks leave behind for response decoration.
struct CheckArtifacts {
    /// Decision for the class whose quota headers the client sees.
    decision: Option<RateLimitDecision>,
    /// `(key, tenant_id)` to mark completed after the handler runs.
    idempotency_claim: Option<(String, String)>,
}

/// Run the ordered checks. The request comes back (possibly with a
/// re-materialized body) only when every check passed.
async fn run_checks(
    components: &PipelineComponents,
    mut req: Request<Body>,
) -> Result<(Request<Body>, CheckArtifacts), MiddlewareError> {
    // 1. Auth: establish the tenant before anything consumes quota.
    let identity = components
        .resolver
        .resolve(req.headers())
        .await
        .map_err(|e| reject("auth", e))?;

    let context = RequestContext::from_request(&req, identity.tenant_id.clone(), identity.user_id);
    components.registry.register(context.clone()).await;
    debug!(
        request_id = %context.id,
        tenant_id = %context.tenant_id,
        path = %context.path,
        "Pipeline accepted identity"
    );
    req.extensions_mut().insert(context);

    let is_webhook = req
        .uri()
        .path()
        .starts_with(&components.config.webhook_path_prefix);

    // 2. Rate limit. Webhook routes consume the webhook class; everything
    // else consumes api, burst, and the aggregate tenant ceiling. The
    // first class's decision feeds the X-RateLimit response headers.
    let decision = if is_webhook {
        components
            .bank
            .check(LimiterClass::Webhook, &identity.tenant_id)
            .await
            .map_err(|e| reject("rate_limit", e))?
    } else {
        let api = components
            .bank
            .check(LimiterClass::Api, &identity.tenant_id)
            .await
            .map_err(|e| reject("rate_limit", e))?;
        components
            .bank
            .check(LimiterClass::Burst, &identity.tenant_id)
            .await
            .map_err(|e| reject("rate_limit", e))?;
        components
            .bank
            .check(LimiterClass::Tenant, &identity.tenant_id)
            .await
            .map_err(|e| reject("rate_limit", e))?;
        api
    };

    // 3. Signature: webhook routes must carry a valid payload signature.
    // The body is buffered once here and re-materialized for the handler.
    if is_webhook {
        let (parts, body) = req.into_parts();
        let bytes = axum::body::to_bytes(body, MAX_BUFFERED_BODY)
            .await
            .map_err(|e| {
                reject(
                    "signature",
                    MiddlewareError::BadRequest(format!("unreadable request body: {e}")),
                )
            })?;

        let signature = parts
            .headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());
        let timestamp = parts
            .headers
            .get(SIGNATURE_TIMESTAMP_HEADER)
            .and_then(|v| v.to_str().ok());

        components
            .verifier
            .verify(signature, timestamp, &bytes)
            .map_err(|e| reject("signature", e))?;

        req = Request::from_parts(parts, Body::from(bytes));
    }

    // 4. Idempotency: claim the key if the client supplied one.
    let mut idempotency_claim = None;
    let idempotency_key = req
        .headers()
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    if let Some(key) = idempotency_key {
        match components.idempotency.begin(&key, &identity.tenant_id).await {
            Ok(BeginOutcome::Proceed) => {
                idempotency_claim = Some((key, identity.tenant_id.clone()));
            }
            Ok(BeginOutcome::Duplicate { status, .. }) => {
                crate::metrics::record_idempotency_replay();
                return Err(reject(
                    "idempotency",
                    MiddlewareError::DuplicateRequest(format!(
                        "idempotency key already {status:?}"
                    )),
                ));
            }
            Err(err) => match components.config.internal_error_policy {
                InternalErrorPolicy::FailOpen => {
                    // Explicit trade: the request runs without dedup
                    // protection rather than bouncing on store trouble.
                    warn!(
                        tenant_id = %identity.tenant_id,
                        error = %err,
                        "Idempotency store failed, admitting without dedup (fail-open)"
                    );
                }
                InternalErrorPolicy::FailClosed => {
                    return Err(reject("idempotency", err));
                }
            },
        }
    }

    // 5. Feature entitlement for gated routes.
    if let Some(feature) = feature_for(&components.config.feature_routes, req.uri().path()) {
        components
            .features
            .require_feature(&identity.tenant_id, feature)
            .await
            .map_err(|e| reject("feature", e))?;
    }

    Ok((
        req,
        CheckArtifacts {
            decision: Some(decision).filter(|d| d.limit > 0),
            idempotency_claim,
        },
    ))
}

/// Count the rejection against its check and pass the error through.
fn reject(check: &str, err: MiddlewareError) -> MiddlewareError {
    crate::metrics::record_pipeline_rejection(check);
    err
}

/// Feature name for the first matching route prefix, if any.
fn feature_for<'a>(routes: &'a [(String, String)], path: &str) -> Option<&'a str> {
    routes
        .iter()
        .find(|(prefix, _)| path.starts_with(prefix.as_str()))
        .map(|(_, feature)| feature.as_str())
}

/// Opaque fingerprint of a completed request's outcome.
fn result_hash(status: u16) -> String {
    let digest = Sha256::digest(format!("status:{status}").as_bytes());
    hex::encode(digest)
}

fn apply_rate_limit_headers(response: &mut Response<Body>, decision: &RateLimitDecision) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert(X_RATELIMIT_LIMIT, v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert(X_RATELIMIT_REMAINING, v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.reset_time.to_string()) {
        headers.insert(X_RATELIMIT_RESET, v);
    }
}

fn apply_timing_headers(response: &mut Response<Body>, overhead_secs: f64, total_secs: f64) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&format!("{:.1}ms", total_secs * 1000.0)) {
        headers.insert(X_PROCESSING_TIME, v);
    }
    if let Ok(v) = HeaderValue::from_str(&format!(
        "pipeline;dur={:.1}, total;dur={:.1}",
        overhead_secs * 1000.0,
        total_secs * 1000.0
    )) {
        headers.insert(SERVER_TIMING, v);
    }
}
