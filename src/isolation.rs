//! Cross-tenant access detection and audit trail.
//!
//! The guard sits beside the request pipeline as a second line of defense:
//! even with per-tenant auth in front, a handler bug can still reach for
//! another tenant's data. Both checks record a [`TenantViolation`] in a
//! bounded in-memory audit log; CRITICAL violations additionally log at
//! error level and dispatch a detached alert. Detection never blocks or
//! fails the request on its own internal errors.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{error, warn};

use crate::alert::{Alert, AlertDispatcher};
use crate::context::ContextRegistry;

/// Severity of a detected violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ViolationSeverity {
    /// Cross-tenant data access attempt.
    Critical,
    /// Suspicious but not provably cross-tenant, e.g. a denylisted query.
    Medium,
}

impl ViolationSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationSeverity::Critical => "CRITICAL",
            ViolationSeverity::Medium => "MEDIUM",
        }
    }
}

/// One audit-log entry. Append-only; entries are never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct TenantViolation {
    pub severity: ViolationSeverity,
    pub request_id: String,
    /// Tenant the request authenticated as, `"unknown"` if unregistered.
    pub context_tenant_id: String,
    /// Tenant whose data the operation targeted.
    pub target_tenant_id: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

/// Substrings that flag a raw query as suspicious, matched case-insensitively.
const QUERY_DENYLIST: &[&str] = &[
    "drop table",
    "drop database",
    "truncate",
    "delete from tenants",
    "update tenants",
    "information_schema",
    "pg_catalog",
    "--",
    "union select",
];

/// Detects and records cross-tenant access attempts.
#[derive(Clone)]
pub struct TenantIsolationGuard {
    registry: Arc<ContextRegistry>,
    violations: Arc<RwLock<VecDeque<TenantViolation>>>,
    capacity: usize,
    dispatcher: AlertDispatcher,
}

impl TenantIsolationGuard {
    pub fn new(
        registry: Arc<ContextRegistry>,
        capacity: usize,
        dispatcher: AlertDispatcher,
    ) -> Self {
        Self {
            registry,
            violations: Arc::new(RwLock::new(VecDeque::with_capacity(capacity.max(1)))),
            capacity: capacity.max(1),
            dispatcher,
        }
    }

    /// Check that the request behind `request_id` is allowed to touch
    /// `target_tenant_id`.
    ///
    /// Returns `false` and records one CRITICAL violation on mismatch. An
    /// unregistered or expired context cannot prove ownership and is
    /// treated as a mismatch with tenant `"unknown"`.
    pub async fn validate_tenant_access(&self, request_id: &str, target_tenant_id: &str) -> bool {
        let context_tenant = self
            .registry
            .get(request_id)
            .await
            .map(|ctx| ctx.tenant_id)
            .unwrap_or_else(|| "unknown".to_string());

        if context_tenant == target_tenant_id {
            return true;
        }

        self.record(TenantViolation {
            severity: ViolationSeverity::Critical,
            request_id: request_id.to_string(),
            context_tenant_id: context_tenant.clone(),
            target_tenant_id: target_tenant_id.to_string(),
            description: format!(
                "request authenticated as tenant '{context_tenant}' attempted to access tenant '{target_tenant_id}'"
            ),
            timestamp: Utc::now(),
        })
        .await;

        false
    }

    /// Scan a raw query string against the denylist.
    ///
    /// Returns `false` and records one MEDIUM violation on a match. This is
    /// a tripwire, not a parser: it flags operations no tenant-scoped
    /// request should ever issue.
    pub async fn validate_query_execution(
        &self,
        request_id: &str,
        tenant_id: &str,
        query: &str,
    ) -> bool {
        let lowered = query.to_lowercase();
        let Some(matched) = QUERY_DENYLIST.iter().find(|kw| lowered.contains(*kw)) else {
            return true;
        };

        self.record(TenantViolation {
            severity: ViolationSeverity::Medium,
            request_id: request_id.to_string(),
            context_tenant_id: tenant_id.to_string(),
            target_tenant_id: tenant_id.to_string(),
            description: format!("query matched denylisted pattern '{matched}'"),
            timestamp: Utc::now(),
        })
        .await;

        false
    }

    async fn record(&self, violation: TenantViolation) {
        crate::metrics::record_tenant_violation(violation.severity.as_str());

        match violation.severity {
            ViolationSeverity::Critical => {
                error!(
                    request_id = %violation.request_id,
                    context_tenant = %violation.context_tenant_id,
                    target_tenant = %violation.target_tenant_id,
                    "CRITICAL tenant isolation violation"
                );
                self.dispatcher.dispatch(Alert {
                    text: format!(
                        "Tenant isolation violation: {} -> {}",
                        violation.context_tenant_id, violation.target_tenant_id
                    ),
                    details: serde_json::json!({
                        "severity": violation.severity.as_str(),
                        "request_id": violation.request_id,
                        "context_tenant_id": violation.context_tenant_id,
                        "target_tenant_id": violation.target_tenant_id,
                        "description": violation.description,
                        "timestamp": violation.timestamp.to_rfc3339(),
                    }),
                });
            }
            ViolationSeverity::Medium => {
                warn!(
                    request_id = %violation.request_id,
                    tenant = %violation.context_tenant_id,
                    description = %violation.description,
                    "Suspicious query blocked"
                );
            }
        }

        let mut violations = self.violations.write().await;
        if violations.len() >= self.capacity {
            violations.pop_front();
        }
        violations.push_back(violation);
    }

    /// Snapshot of recorded violations, oldest first.
    pub async fn violations(&self) -> Vec<TenantViolation> {
        self.violations.read().await.iter().cloned().collect()
    }

    pub async fn violation_count(&self) -> usize {
        self.violations.read().await.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::alert::AlertSink;
    use crate::context::RequestContext;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::task::TaskTracker;

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

    fn context(request_id: &str, tenant_id: &str) -> RequestContext {
        RequestContext {
            id: request_id.to_string(),
            tenant_id: tenant_id.to_string(),
            user_id: Some("user-1".to_string()),
            timestamp: Utc::now(),
            ip: "203.0.113.9".to_string(),
            user_agent: None,
            method: "GET".to_string(),
            path: "/v1/reports".to_string(),
            query: None,
            headers: Default::default(),
        }
    }

    fn guard() -> (TenantIsolationGuard, Arc<ContextRegistry>, Arc<RecordingSink>, TaskTracker) {
        let registry = Arc::new(ContextRegistry::new(64, Duration::from_secs(60)));
        let sink = Arc::new(RecordingSink::default());
        let tracker = TaskTracker::new();
        let guard = TenantIsolationGuard::new(
            registry.clone(),
            32,
            AlertDispatcher::new(sink.clone(), tracker.clone()),
        );
        (guard, registry, sink, tracker)
    }

    #[tokio::test]
    async fn test_matching_tenant_passes() {
        let (guard, registry, _, _) = guard();
        registry.register(context("req-1", "tenant-a")).await;

        assert!(guard.validate_tenant_access("req-1", "tenant-a").await);
        assert_eq!(guard.violation_count().await, 0);
    }

    #[tokio::test]
    async fn test_cross_tenant_access_records_critical_violation() {
        let (guard, registry, sink, tracker) = guard();
        registry.register(context("req-1", "tenant-a")).await;

        assert!(!guard.validate_tenant_access("req-1", "tenant-b").await);

        let violations = guard.violations().await;
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, ViolationSeverity::Critical);
        assert_eq!(violations[0].context_tenant_id, "tenant-a");
        assert_eq!(violations[0].target_tenant_id, "tenant-b");

        tracker.close();
        tracker.wait().await;
        assert_eq!(sink.received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_request_id_is_a_mismatch() {
        let (guard, _, _, _) = guard();

        assert!(!guard.validate_tenant_access("req-missing", "tenant-a").await);

        let violations = guard.violations().await;
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].context_tenant_id, "unknown");
    }

    #[tokio::test]
    async fn test_clean_query_passes() {
        let (guard, _, _, _) = guard();
        let ok = guard
            .validate_query_execution(
                "req-1",
                "tenant-a",
                "SELECT id, name FROM leads WHERE tenant_id = $1",
            )
            .await;

        assert!(ok);
        assert_eq!(guard.violation_count().await, 0);
    }

    #[tokio::test]
    async fn test_denylisted_query_records_medium_violation() {
        let (guard, _, sink, tracker) = guard();
        let ok = guard
            .validate_query_execution("req-1", "tenant-a", "SELECT 1; DROP TABLE leads")
            .await;

        assert!(!ok);
        let violations = guard.violations().await;
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, ViolationSeverity::Medium);

        // MEDIUM violations are logged but do not alert.
        tracker.close();
        tracker.wait().await;
        assert!(sink.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_denylist_match_is_case_insensitive() {
        let (guard, _, _, _) = guard();
        assert!(
            !guard
                .validate_query_execution("req-1", "tenant-a", "select * from Information_Schema.tables")
                .await
        );
    }

    #[tokio::test]
    async fn test_audit_log_is_bounded() {
        let registry = Arc::new(ContextRegistry::new(64, Duration::from_secs(60)));
        let tracker = TaskTracker::new();
        let guard = TenantIsolationGuard::new(
            registry,
            4,
            AlertDispatcher::new(Arc::new(RecordingSink::default()), tracker),
        );

        for i in 0..10 {
            guard
                .validate_tenant_access(&format!("req-{i}"), "tenant-b")
                .await;
        }

        assert_eq!(guard.violation_count().await, 4);
        let violations = guard.violations().await;
        // Oldest entries were evicted.
        assert_eq!(violations[0].request_id, "req-6");
    }
}
