//! Per-request context construction and registration.
//!
//! Every request entering the pipeline gets an immutable [`RequestContext`]:
//! identifiers, tenant binding, timing, and network metadata. Contexts are
//! registered in a bounded, TTL-evicted [`ContextRegistry`] keyed by request
//! id so the tenant-isolation guard can later answer "which tenant does
//! request X belong to?" without re-trusting caller-supplied data.
//!
//! # Invariant
//!
//! `RequestContext.tenant_id` never changes after creation. The struct has
//! no mutating API and the registry only inserts whole contexts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::Request;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::middleware::ip::{extract_client_ip, extract_user_agent};

/// Header name for caller-supplied request IDs.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Immutable per-request context.
///
/// Built once by the pipeline after tenant resolution and handed to the
/// business handler via request extensions. Lives only for the request's
/// duration plus the registry TTL.
#[derive(Debug, Clone, Serialize)]
pub struct RequestContext {
    /// Request id: caller-supplied `X-Request-Id` or a generated UUIDv4.
    pub id: String,
    /// Tenant this request is bound to.
    pub tenant_id: String,
    /// Authenticated user within the tenant, when known.
    pub user_id: Option<String>,
    /// When the context was created.
    pub timestamp: DateTime<Utc>,
    /// Client IP (from forwarded headers, "unknown" when absent).
    pub ip: String,
    /// Client user agent, when supplied.
    pub user_agent: Option<String>,
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Raw query string, when present.
    pub query: Option<String>,
    /// Request headers captured for audit, minus credential-bearing ones.
    /// Values are length-capped; non-ASCII values are skipped.
    pub headers: HashMap<String, String>,
}

/// Headers never captured into the context; they carry credentials.
const REDACTED_HEADERS: &[&str] = &["authorization", "proxy-authorization", "cookie"];

/// Caps so a single request cannot bloat the registry.
const MAX_CAPTURED_HEADERS: usize = 32;
const MAX_HEADER_VALUE_LEN: usize = 256;

fn capture_headers(req: &Request<Body>) -> HashMap<String, String> {
    let mut captured = HashMap::new();
    for (name, value) in req.headers() {
        if captured.len() >= MAX_CAPTURED_HEADERS {
            break;
        }
        if REDACTED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            let mut value = value.to_string();
            value.truncate(MAX_HEADER_VALUE_LEN);
            captured.insert(name.as_str().to_string(), value);
        }
    }
    captured
}

impl RequestContext {
    /// Build a context from an inbound request and a resolved tenant.
    ///
    /// Generates a fresh request id when the caller supplied none. This is
    /// the only constructor; there is no way to change a field afterwards.
    pub fn from_request(
        req: &Request<Body>,
        tenant_id: String,
        user_id: Option<String>,
    ) -> Self {
        let id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            id,
            tenant_id,
            user_id,
            timestamp: Utc::now(),
            ip: extract_client_ip(req).into_owned(),
            user_agent: extract_user_agent(req),
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
            query: req.uri().query().map(str::to_string),
            headers: capture_headers(req),
        }
    }
}

/// A registered context with its eviction deadline.
#[derive(Debug, Clone)]
struct RegisteredContext {
    context: RequestContext,
    expires_at: Instant,
}

/// Bounded, TTL-evicted map of live request contexts keyed by request id.
///
/// # Bounds
///
/// The registry never exceeds its configured capacity: when full, inserting
/// evicts the entry closest to expiry. Expired entries are skipped on read
/// and reclaimed by [`ContextRegistry::sweep_expired`] from a background task.
#[derive(Clone)]
pub struct ContextRegistry {
    contexts: Arc<RwLock<HashMap<String, RegisteredContext>>>,
    capacity: usize,
    ttl: Duration,
}

impl ContextRegistry {
    /// Create a registry holding at most `capacity` contexts for `ttl` each.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            contexts: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Register a context under its request id.
    pub async fn register(&self, context: RequestContext) {
        let now = Instant::now();
        let mut contexts = self.contexts.write().await;

        // Capacity cap: drop the entry nearest expiry rather than grow.
        if contexts.len() >= self.capacity && !contexts.contains_key(&context.id) {
            let oldest = contexts
                .iter()
                .min_by_key(|(_, v)| v.expires_at)
                .map(|(k, _)| k.clone());
            if let Some(key) = oldest {
                warn!(evicted = %key, capacity = self.capacity, "Context registry full, evicting oldest entry");
                contexts.remove(&key);
            }
        }

        trace!(request_id = %context.id, tenant_id = %context.tenant_id, "Registered request context");
        contexts.insert(
            context.id.clone(),
            RegisteredContext {
                context,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Look up a live context by request id.
    pub async fn get(&self, request_id: &str) -> Option<RequestContext> {
        let contexts = self.contexts.read().await;
        contexts
            .get(request_id)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.context.clone())
    }

    /// Remove expired contexts.
    pub async fn sweep_expired(&self) {
        let now = Instant::now();
        let mut contexts = self.contexts.write().await;
        let before = contexts.len();
        contexts.retain(|_, entry| entry.expires_at > now);
        let removed = before - contexts.len();
        if removed > 0 {
            debug!(removed, "Swept expired request contexts");
        }
    }

    /// Number of registered (possibly expired but unswept) contexts.
    pub async fn len(&self) -> usize {
        self.contexts.read().await.len()
    }

    /// Whether no contexts are registered.
    pub async fn is_empty(&self) -> bool {
        self.contexts.read().await.is_empty()
    }
}
