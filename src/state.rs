//! Shared application state for Axum handlers.
//!
//! This module wires the pipeline's collaborators together and owns their
//! lifecycle:
//!
//! - **Store**: the shared key-value store behind limiters and idempotency
//! - **Limiter bank**: per-class rate limiters built from configuration
//! - **SLO monitor** and **isolation guard**: observability and audit
//! - **Alert dispatcher**: detached delivery of breach and violation alerts
//!
//! # Thread Safety
//!
//! `AppState` is cloned per request handler; all components are behind
//! `Arc` or are internally synchronized.
//!
//! # Structured Concurrency
//!
//! Background sweeps run on a `TaskTracker` with a `CancellationToken`.
//! Call [`AppState::shutdown`] before exit to stop the sweeps and wait for
//! in-flight alert deliveries.

use std::sync::Arc;
use std::time::Instant;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::alert::{AlertDispatcher, AlertSink, LogAlertSink, WebhookAlertSink};
use crate::config::Config;
use crate::context::ContextRegistry;
use crate::error::{MiddlewareError, MiddlewareResult};
use crate::idempotency::IdempotencyStore;
use crate::isolation::TenantIsolationGuard;
use crate::limiter::RateLimiterBank;
use crate::middleware::pipeline::{PipelineComponents, PipelineConfig, RequestPipeline};
use crate::resolver::{FeatureResolver, HeaderTenantResolver, StaticFeatureResolver, TenantResolver};
use crate::signature::SignatureVerifier;
use crate::slo::SloMonitor;
use crate::store::MemoryStore;

/// Shared application state for Axum handlers.
///
/// # Lifecycle
///
/// Background sweep tasks are spawned on creation. Call `shutdown()` before
/// dropping to terminate them cleanly:
///
/// ```rust,ignore
/// let state = AppState::new(config)?;
/// // ... serve ...
/// state.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Shared key-value store behind limiters and idempotency records.
    pub store: MemoryStore,
    /// Per-class rate limiters.
    pub bank: Arc<RateLimiterBank>,
    /// Idempotency record store.
    pub idempotency: IdempotencyStore,
    /// Webhook payload signature verifier.
    pub verifier: SignatureVerifier,
    /// Streaming SLO monitor.
    pub slo: SloMonitor,
    /// Tenant isolation guard and audit log.
    pub guard: TenantIsolationGuard,
    /// Live request contexts keyed by request id.
    pub registry: Arc<ContextRegistry>,
    /// Detached alert delivery.
    pub dispatcher: AlertDispatcher,
    /// Tenant identity resolution seam.
    pub resolver: Arc<dyn TenantResolver>,
    /// Feature entitlement seam.
    pub features: Arc<dyn FeatureResolver>,
    /// Timestamp when the application started.
    pub started_at: Instant,
    /// Application configuration.
    pub config: Arc<Config>,
    /// Path routing decisions for the pipeline.
    pipeline_config: PipelineConfig,
    /// Tracks spawned background tasks for graceful shutdown.
    task_tracker: TaskTracker,
    /// Cancellation token for signaling background tasks to stop.
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Build state with the default gateway-header resolver and an
    /// allow-all feature resolver.
    ///
    /// # Errors
    ///
    /// Fails when the alert webhook client cannot be constructed.
    pub fn new(config: Config) -> MiddlewareResult<Self> {
        Self::with_resolvers(
            config,
            Arc::new(HeaderTenantResolver),
            Arc::new(StaticFeatureResolver::allow_all()),
        )
    }

    /// Build state with injected tenant and feature resolvers.
    ///
    /// # Errors
    ///
    /// Fails when the alert webhook client cannot be constructed.
    pub fn with_resolvers(
        config: Config,
        resolver: Arc<dyn TenantResolver>,
        features: Arc<dyn FeatureResolver>,
    ) -> MiddlewareResult<Self> {
        let store = MemoryStore::new();
        let shared_store: Arc<dyn crate::store::KeyValueStore> = Arc::new(store.clone());

        let task_tracker = TaskTracker::new();
        let cancellation_token = CancellationToken::new();

        let sink: Arc<dyn AlertSink> = match &config.alert_webhook_url {
            Some(url) => {
                info!(url = %url, "Alert delivery via webhook");
                Arc::new(
                    WebhookAlertSink::new(url.clone(), config.alert_timeout).map_err(|e| {
                        MiddlewareError::ConfigError(format!("alert webhook client: {e}"))
                    })?,
                )
            }
            None => {
                info!("No alert webhook configured, alerts will be logged");
                Arc::new(LogAlertSink)
            }
        };
        let dispatcher = AlertDispatcher::new(sink, task_tracker.clone());

        let bank = Arc::new(RateLimiterBank::new(
            shared_store.clone(),
            &config.limiter_classes(),
        ));
        let idempotency = IdempotencyStore::new(
            shared_store,
            config.idempotency_pending_ttl,
            config.idempotency_completed_ttl,
        );
        let verifier = SignatureVerifier::new(
            config.webhook_secret.clone(),
            config.signature_replay_window,
        );
        let slo = SloMonitor::new(
            config.slo_buffer_capacity,
            config.slo_thresholds(),
            dispatcher.clone(),
        );
        let registry = Arc::new(ContextRegistry::new(
            config.context_capacity,
            config.context_ttl,
        ));
        let guard = TenantIsolationGuard::new(
            registry.clone(),
            config.violation_log_capacity,
            dispatcher.clone(),
        );

        let pipeline_config = PipelineConfig {
            internal_error_policy: config.internal_error_policy,
            ..PipelineConfig::default()
        };

        let state = Self {
            store,
            bank,
            idempotency,
            verifier,
            slo,
            guard,
            registry,
            dispatcher,
            resolver,
            features,
            started_at: Instant::now(),
            config: Arc::new(config),
            pipeline_config,
            task_tracker,
            cancellation_token,
        };

        state.spawn_sweep_task();

        Ok(state)
    }

    /// Gate paths under `prefix` behind `feature`.
    pub fn with_feature_route(mut self, prefix: &str, feature: &str) -> Self {
        self.pipeline_config
            .feature_routes
            .push((prefix.to_string(), feature.to_string()));
        self
    }

    /// Build the request pipeline layer over this state's components.
    pub fn pipeline(&self) -> RequestPipeline {
        RequestPipeline::new(Arc::new(PipelineComponents {
            resolver: self.resolver.clone(),
            features: self.features.clone(),
            bank: self.bank.clone(),
            verifier: self.verifier.clone(),
            idempotency: self.idempotency.clone(),
            registry: self.registry.clone(),
            slo: self.slo.clone(),
            config: self.pipeline_config.clone(),
        }))
    }

    /// Spawn the background sweep task.
    ///
    /// One interval drives all periodic maintenance: expired store entries,
    /// expired request contexts, and aged-out SLO breach records.
    fn spawn_sweep_task(&self) {
        let store = self.store.clone();
        let registry = self.registry.clone();
        let slo = self.slo.clone();
        let sweep_interval = self.config.sweep_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(sweep_interval);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased; // Check cancellation first

                    _ = cancel.cancelled() => {
                        debug!("Sweep task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        store.sweep_expired().await;
                        registry.sweep_expired().await;
                        slo.prune_breaches().await;
                    }
                }
            }

            debug!("Sweep task shutting down");
        });
    }

    /// Gracefully shutdown all background tasks.
    ///
    /// Signals the sweep task to stop, closes the tracker, and waits for
    /// every tracked task (including in-flight alert deliveries) to finish.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_builds_from_default_config() {
        let state = AppState::new(Config::default()).unwrap();
        assert_eq!(state.uptime_seconds(), 0);
        assert!(!state.verifier.is_configured());
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_feature_route_reaches_pipeline_config() {
        let state = AppState::new(Config::default())
            .unwrap()
            .with_feature_route("/v1/insights", "competitor_insights");

        assert_eq!(
            state.pipeline_config.feature_routes,
            vec![(
                "/v1/insights".to_string(),
                "competitor_insights".to_string()
            )]
        );
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_completes() {
        let state = AppState::new(Config::default()).unwrap();
        state.shutdown().await;
        // Second call is idempotent.
        state.shutdown().await;
    }
}
