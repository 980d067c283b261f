//! Application routing configuration with middleware stack.
//!
//! # Route Groups
//!
//! ```text
//! Guarded (full pipeline)          Operator (no pipeline)
//! ───────────────────────          ──────────────────────
//! POST /v1/leads                   GET /health
//! GET  /v1/reports                 GET /ready
//! POST /webhooks/{source}          GET /slo/report
//!                                  GET /violations
//! ```
//!
//! Guarded routes run the full check sequence (auth, rate limit, signature
//! on webhook paths, idempotency, feature). Operator routes are for health
//! probes and on-call tooling and sit outside the tenant pipeline; protect
//! them at the network layer.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers;
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
///
/// The pipeline layer wraps only the guarded route group; CORS and HTTP
/// tracing wrap everything.
pub fn build_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config.cors_allowed_origins);

    let guarded = Router::new()
        .route("/v1/leads", post(handlers::create_lead))
        .route("/v1/reports", get(handlers::get_report))
        .route("/webhooks/{source}", post(handlers::receive_webhook))
        .layer(state.pipeline());

    let operator = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/slo/report", get(handlers::slo_report))
        .route("/violations", get(handlers::list_violations));

    info!(
        signatures = state.verifier.is_configured(),
        "Router built"
    );

    guarded
        .merge(operator)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Build CORS layer from configuration.
///
/// # Security Note
///
/// Using `*` (any origin) is convenient for development but should be
/// avoided in production. Specify explicit origins instead.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_cors_layer_any() {
        let origins = vec!["*".to_string()];
        let _layer = build_cors_layer(&origins);
        // Just verify it doesn't panic
    }

    #[test]
    fn test_build_cors_layer_specific() {
        let origins = vec![
            "https://app.example.com".to_string(),
            "https://admin.example.com".to_string(),
        ];
        let _layer = build_cors_layer(&origins);
        // Just verify it doesn't panic
    }
}
