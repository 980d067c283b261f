//! Asynchronous alert delivery.
//!
//! SLO breaches and critical tenant violations notify an external sink with
//! a structured `{text, details}` payload. Delivery is explicitly detached:
//! it runs on a tracked background task, its failures are logged on their
//! own channel and never retried synchronously, and nothing about it sits
//! on the response path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Structured alert payload.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    /// Human-readable summary line.
    pub text: String,
    /// Machine-readable context.
    pub details: Value,
}

/// Destination for alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver one alert. Failures are the sink's to report; callers never
    /// retry.
    async fn notify(&self, alert: Alert);
}

/// Sink that logs alerts instead of delivering them externally.
///
/// The default when no alert webhook URL is configured.
#[derive(Debug, Clone, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, alert: Alert) {
        warn!(text = %alert.text, details = %alert.details, "ALERT");
    }
}

/// Sink that POSTs the alert JSON to a webhook URL.
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    /// Build a sink for `url` with a short delivery timeout.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error if the client cannot be constructed.
    pub fn new(url: String, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url,
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn notify(&self, alert: Alert) {
        match self.client.post(&self.url).json(&alert).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(text = %alert.text, "Alert delivered");
            }
            Ok(response) => {
                // Logged and dropped; the breach is still surfaced in reports.
                warn!(
                    status = %response.status(),
                    text = %alert.text,
                    "Alert sink returned non-success status"
                );
            }
            Err(e) => {
                warn!(error = %e, text = %alert.text, "Alert delivery failed");
            }
        }
    }
}

/// Fire-and-forget dispatcher over a shared sink.
///
/// Spawned tasks are tracked so graceful shutdown can wait for in-flight
/// deliveries without ever having blocked a response on one.
#[derive(Clone)]
pub struct AlertDispatcher {
    sink: Arc<dyn AlertSink>,
    tracker: TaskTracker,
}

impl AlertDispatcher {
    pub fn new(sink: Arc<dyn AlertSink>, tracker: TaskTracker) -> Self {
        Self { sink, tracker }
    }

    /// Queue an alert for detached delivery and return immediately.
    pub fn dispatch(&self, alert: Alert) {
        let sink = self.sink.clone();
        self.tracker.spawn(async move {
            sink.notify(alert).await;
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Sink that records alerts for assertions.
    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<Alert>>,
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn notify(&self, alert: Alert) {
            self.received.lock().unwrap().push(alert);
        }
    }

    #[tokio::test]
    async fn test_dispatch_is_detached_and_delivers() {
        let sink = Arc::new(RecordingSink::default());
        let tracker = TaskTracker::new();
        let dispatcher = AlertDispatcher::new(sink.clone(), tracker.clone());

        dispatcher.dispatch(Alert {
            text: "p95 latency breach on /v1/reports".to_string(),
            details: serde_json::json!({"threshold_ms": 250, "actual_ms": 410}),
        });

        // dispatch() returned without awaiting delivery; wait for the task.
        tracker.close();
        tracker.wait().await;

        let received = sink.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert!(received[0].text.contains("p95"));
    }

    #[tokio::test]
    async fn test_log_sink_does_not_panic() {
        LogAlertSink
            .notify(Alert {
                text: "test".to_string(),
                details: serde_json::json!({}),
            })
            .await;
    }
}
