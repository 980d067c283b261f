//! End-to-end tests for the request pipeline over the full router.
//!
//! These drive the router directly with `tower::ServiceExt::oneshot`, so
//! every check (auth, rate limit, signature, idempotency, feature) runs
//! exactly as it does in production, without binding a socket.
//!
//! Run with: `cargo test --test pipeline_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header::CONTENT_TYPE};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use tenantguard::signature::{
    SIGNATURE_HEADER, SIGNATURE_TIMESTAMP_HEADER, SignatureVerifier,
};
use tenantguard::{AppState, Config, build_router};

/// Config tuned for deterministic tests: tight api limit, no burst class.
fn test_config() -> Config {
    Config {
        rate_limit_api_per_min: 5,
        rate_limit_burst_per_10s: 0,
        rate_limit_tenant_per_hour: 10_000,
        rate_limit_webhook_per_min: 50,
        metrics_port: 0,
        ..Config::default()
    }
}

fn app(config: Config) -> (Router, AppState) {
    let state = AppState::new(config).expect("state should build");
    (build_router(state.clone()), state)
}

fn lead_request(tenant: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/leads")
        .header("x-tenant-id", tenant)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"name": "Jamie Rivera", "source": "web"}).to_string(),
        ))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

#[tokio::test]
async fn health_endpoint_is_open() {
    let (router, state) = app(test_config());

    let response = router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    state.shutdown().await;
}

#[tokio::test]
async fn missing_tenant_identity_is_unauthorized() {
    let (router, state) = app(test_config());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/leads")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"name": "x", "source": "web"}).to_string()))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let body = body_json(response).await;
    assert_eq!(body["error"], "authentication_required");
    state.shutdown().await;
}

#[tokio::test]
async fn accepted_request_carries_quota_and_timing_headers() {
    let (router, state) = app(test_config());

    let response = router.oneshot(lead_request("tenant-a")).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let headers = response.headers();
    assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "5");
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "4");
    assert!(headers.contains_key("x-ratelimit-reset"));
    assert!(headers.contains_key("x-processing-time"));
    let timing = headers.get("server-timing").unwrap().to_str().unwrap();
    assert!(timing.contains("pipeline;dur="));
    state.shutdown().await;
}

#[tokio::test]
async fn api_limit_admits_exactly_the_cap_then_rejects_with_retry_after() {
    let (router, state) = app(test_config());

    for i in 1..=5 {
        let response = router.clone().oneshot(lead_request("tenant-a")).await.unwrap();
        assert_eq!(
            response.status(),
            StatusCode::CREATED,
            "request {i} should be within quota"
        );
    }

    let rejected = router.clone().oneshot(lead_request("tenant-a")).await.unwrap();
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = rejected
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);

    // Another tenant is unaffected.
    let other = router.oneshot(lead_request("tenant-b")).await.unwrap();
    assert_eq!(other.status(), StatusCode::CREATED);
    state.shutdown().await;
}

#[tokio::test]
async fn api_quota_recovers_in_the_next_window() {
    use std::sync::Arc;
    use tenantguard::limiter::{
        Algorithm, ClassConfig, FailurePolicy, LimiterClass, RateLimiterBank,
    };

    let mut state = AppState::new(test_config()).expect("state should build");
    // One-second api window so the reset is observable in-test.
    state.bank = Arc::new(RateLimiterBank::new(
        Arc::new(state.store.clone()),
        &[(
            LimiterClass::Api,
            ClassConfig {
                limit: 2,
                window: Duration::from_secs(1),
                algorithm: Algorithm::FixedWindow,
                failure_policy: FailurePolicy::Open,
            },
        )],
    ));
    let router = build_router(state.clone());

    // Exhaust the window. The loop tolerates a window boundary falling
    // between requests.
    let mut limited = false;
    for _ in 0..6 {
        let response = router.clone().oneshot(lead_request("tenant-a")).await.unwrap();
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            limited = true;
            break;
        }
        assert_eq!(response.status(), StatusCode::CREATED);
    }
    assert!(limited, "quota should exhaust within one window");

    // The next window starts at most one second after the rejection.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let recovered = router.oneshot(lead_request("tenant-a")).await.unwrap();
    assert_eq!(recovered.status(), StatusCode::CREATED);
    state.shutdown().await;
}

#[tokio::test]
async fn duplicate_idempotency_key_conflicts() {
    let (router, state) = app(test_config());

    let request = |tenant: &str| {
        Request::builder()
            .method("POST")
            .uri("/v1/leads")
            .header("x-tenant-id", tenant)
            .header("idempotency-key", "order-42")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"name": "x", "source": "web"}).to_string()))
            .unwrap()
    };

    let first = router.clone().oneshot(request("tenant-a")).await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);

    let second = router.clone().oneshot(request("tenant-a")).await.unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let body = body_json(second).await;
    assert_eq!(body["error"], "duplicate_request");

    // Keys are scoped per tenant.
    let other_tenant = router.oneshot(request("tenant-b")).await.unwrap();
    assert_eq!(other_tenant.status(), StatusCode::CREATED);
    state.shutdown().await;
}

#[tokio::test]
async fn webhook_with_valid_signature_is_accepted() {
    let config = Config {
        webhook_secret: Some("shared-secret".to_string()),
        ..test_config()
    };
    let (router, state) = app(config);

    let body = json!({"event": "lead.created"}).to_string();
    let now = unix_now();
    let signer = SignatureVerifier::new(
        Some("shared-secret".to_string()),
        Duration::from_secs(300),
    );
    let signature = signer.sign(now, body.as_bytes()).unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/crm")
        .header("x-tenant-id", "tenant-a")
        .header(SIGNATURE_HEADER, signature)
        .header(SIGNATURE_TIMESTAMP_HEADER, now.to_string())
        .body(Body::from(body))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["accepted"], true);
    assert_eq!(body["source"], "crm");
    state.shutdown().await;
}

#[tokio::test]
async fn webhook_with_tampered_body_is_rejected_generically() {
    let config = Config {
        webhook_secret: Some("shared-secret".to_string()),
        ..test_config()
    };
    let (router, state) = app(config);

    let now = unix_now();
    let signer = SignatureVerifier::new(
        Some("shared-secret".to_string()),
        Duration::from_secs(300),
    );
    let signature = signer.sign(now, b"original payload").unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/crm")
        .header("x-tenant-id", "tenant-a")
        .header(SIGNATURE_HEADER, signature)
        .header(SIGNATURE_TIMESTAMP_HEADER, now.to_string())
        .body(Body::from("tampered payload"))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"], "invalid_signature");
    state.shutdown().await;
}

#[tokio::test]
async fn webhook_without_configured_secret_is_rejected() {
    // No WEBHOOK_SECRET: the webhook surface fails closed.
    let (router, state) = app(test_config());

    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/crm")
        .header("x-tenant-id", "tenant-a")
        .body(Body::from("{}"))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    state.shutdown().await;
}

#[tokio::test]
async fn cross_tenant_lead_creation_is_denied_and_audited() {
    let (router, state) = app(test_config());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/leads")
        .header("x-tenant-id", "tenant-a")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"tenant_id": "tenant-b", "name": "x", "source": "web"}).to_string(),
        ))
        .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["error"], "tenant_access_denied");

    let audit = router
        .oneshot(Request::get("/violations").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(audit.status(), StatusCode::OK);
    let audit_body = body_json(audit).await;
    assert_eq!(audit_body["count"], 1);
    assert_eq!(audit_body["violations"][0]["severity"], "CRITICAL");
    assert_eq!(audit_body["violations"][0]["target_tenant_id"], "tenant-b");
    state.shutdown().await;
}

#[tokio::test]
async fn denylisted_report_filter_is_rejected() {
    let (router, state) = app(test_config());

    let request = Request::builder()
        .method("GET")
        .uri("/v1/reports?filter=name%3B%20DROP%20TABLE%20leads")
        .header("x-tenant-id", "tenant-a")
        .body(Body::empty())
        .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let audit = router
        .oneshot(Request::get("/violations").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let audit_body = body_json(audit).await;
    assert_eq!(audit_body["violations"][0]["severity"], "MEDIUM");
    state.shutdown().await;
}

#[tokio::test]
async fn slo_report_reflects_handled_traffic() {
    let (router, state) = app(test_config());

    for _ in 0..3 {
        let request = Request::builder()
            .method("GET")
            .uri("/v1/reports")
            .header("x-tenant-id", "tenant-a")
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let report = router
        .oneshot(
            Request::get("/slo/report?endpoint=/v1/reports&window=1h")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(report.status(), StatusCode::OK);

    let body = body_json(report).await;
    assert_eq!(body["endpoint"], "/v1/reports");
    assert_eq!(body["request_count"], 3);
    assert_eq!(body["error_rate"], 0.0);
    state.shutdown().await;
}

#[tokio::test]
async fn slo_report_rejects_unknown_window() {
    let (router, state) = app(test_config());

    let response = router
        .oneshot(
            Request::get("/slo/report?endpoint=/v1/reports&window=90d")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    state.shutdown().await;
}

#[tokio::test]
async fn feature_gated_route_denies_unentitled_tenant() {
    use std::sync::Arc;
    use tenantguard::resolver::{HeaderTenantResolver, StaticFeatureResolver};

    let state = AppState::with_resolvers(
        test_config(),
        Arc::new(HeaderTenantResolver),
        Arc::new(StaticFeatureResolver::with_features(["leads"])),
    )
    .unwrap()
    .with_feature_route("/v1/reports", "reports")
    .with_feature_route("/v1/leads", "leads");
    let router = build_router(state.clone());

    // Entitled feature passes.
    let allowed = router.clone().oneshot(lead_request("tenant-a")).await.unwrap();
    assert_eq!(allowed.status(), StatusCode::CREATED);

    // Unentitled feature is forbidden.
    let request = Request::builder()
        .method("GET")
        .uri("/v1/reports")
        .header("x-tenant-id", "tenant-a")
        .body(Body::empty())
        .unwrap();
    let denied = router.oneshot(request).await.unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    let body = body_json(denied).await;
    assert_eq!(body["error"], "feature_not_available");
    state.shutdown().await;
}
