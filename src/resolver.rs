//! Collaborator interfaces the pipeline consumes.
//!
//! Tenant authentication and feature entitlements live outside this crate;
//! the pipeline only needs two narrow seams:
//!
//! - [`TenantResolver`]: turn an inbound request's headers into a tenant
//!   (and optional user) identity, or fail with `AuthenticationRequired`.
//! - [`FeatureResolver`]: assert that a tenant is entitled to a named
//!   feature, or fail with `FeatureNotAvailable`.
//!
//! Default implementations are provided for deployments where an upstream
//! gateway has already authenticated the caller and forwards identity
//! headers. Production deployments inject their own resolvers.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;

use crate::error::{MiddlewareError, MiddlewareResult};

/// Identity resolved for an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantIdentity {
    /// The tenant the request is bound to.
    pub tenant_id: String,
    /// Authenticated user within the tenant, when known.
    pub user_id: Option<String>,
}

/// Resolves the tenant identity for an inbound request.
#[async_trait]
pub trait TenantResolver: Send + Sync {
    /// Resolve a tenant from request headers.
    ///
    /// # Errors
    ///
    /// Returns `MiddlewareError::AuthenticationRequired` when no tenant can
    /// be established. This is the only failure mode the pipeline expects.
    async fn resolve(&self, headers: &HeaderMap) -> MiddlewareResult<TenantIdentity>;
}

/// Checks coarse feature entitlements for a tenant.
#[async_trait]
pub trait FeatureResolver: Send + Sync {
    /// Succeed iff `tenant_id` is entitled to `feature`.
    ///
    /// # Errors
    ///
    /// Returns `MiddlewareError::FeatureNotAvailable` otherwise.
    async fn require_feature(&self, tenant_id: &str, feature: &str) -> MiddlewareResult<()>;
}

/// Header name an authenticating gateway uses to forward the tenant id.
pub const TENANT_ID_HEADER: &str = "x-tenant-id";

/// Header name for the authenticated user id, when present.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Resolver that trusts identity headers set by an upstream gateway.
///
/// Only safe when this service is unreachable except through that gateway;
/// a caller who can set `X-Tenant-Id` directly is fully authenticated as
/// far as this resolver is concerned.
#[derive(Debug, Clone, Default)]
pub struct HeaderTenantResolver;

#[async_trait]
impl TenantResolver for HeaderTenantResolver {
    async fn resolve(&self, headers: &HeaderMap) -> MiddlewareResult<TenantIdentity> {
        let tenant_id = headers
            .get(TENANT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                MiddlewareError::AuthenticationRequired("no tenant identity supplied".to_string())
            })?;

        let user_id = headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        Ok(TenantIdentity {
            tenant_id: tenant_id.to_string(),
            user_id,
        })
    }
}

/// Feature resolver backed by a static enabled-feature set.
///
/// An empty set means every feature is enabled (useful for development and
/// tests); otherwise only the named features pass.
#[derive(Debug, Clone, Default)]
pub struct StaticFeatureResolver {
    enabled: Arc<HashSet<String>>,
}

impl StaticFeatureResolver {
    /// Allow every feature.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Allow only the listed features.
    pub fn with_features<I, S>(features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enabled: Arc::new(features.into_iter().map(Into::into).collect()),
        }
    }
}

#[async_trait]
impl FeatureResolver for StaticFeatureResolver {
    async fn require_feature(&self, _tenant_id: &str, feature: &str) -> MiddlewareResult<()> {
        if self.enabled.is_empty() || self.enabled.contains(feature) {
            Ok(())
        } else {
            Err(MiddlewareError::FeatureNotAvailable(feature.to_string()))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_header_resolver_with_tenant() {
        let mut headers = HeaderMap::new();
        headers.insert(TENANT_ID_HEADER, "tenant-a".parse().unwrap());
        headers.insert(USER_ID_HEADER, "user-1".parse().unwrap());

        let identity = HeaderTenantResolver.resolve(&headers).await.unwrap();
        assert_eq!(identity.tenant_id, "tenant-a");
        assert_eq!(identity.user_id.as_deref(), Some("user-1"));
    }

    #[tokio::test]
    async fn test_header_resolver_missing_tenant_fails() {
        let headers = HeaderMap::new();
        let err = HeaderTenantResolver.resolve(&headers).await.unwrap_err();
        assert!(matches!(err, MiddlewareError::AuthenticationRequired(_)));
    }

    #[tokio::test]
    async fn test_header_resolver_empty_tenant_fails() {
        let mut headers = HeaderMap::new();
        headers.insert(TENANT_ID_HEADER, "".parse().unwrap());

        let err = HeaderTenantResolver.resolve(&headers).await.unwrap_err();
        assert!(matches!(err, MiddlewareError::AuthenticationRequired(_)));
    }

    #[tokio::test]
    async fn test_static_feature_resolver_allow_all() {
        let resolver = StaticFeatureResolver::allow_all();
        assert!(resolver.require_feature("t", "anything").await.is_ok());
    }

    #[tokio::test]
    async fn test_static_feature_resolver_denies_unlisted() {
        let resolver = StaticFeatureResolver::with_features(["reports"]);
        assert!(resolver.require_feature("t", "reports").await.is_ok());

        let err = resolver
            .require_feature("t", "competitor_insights")
            .await
            .unwrap_err();
        assert!(matches!(err, MiddlewareError::FeatureNotAvailable(_)));
    }
}
