//! Client network metadata extraction for the pipeline.
//!
//! Provides the forwarded-IP and user-agent lookups used when building the
//! per-request context and when keying abuse protection.
//!
//! # Security Warning: IP Spoofing Risk
//!
//! These functions trust proxy-set headers. Deploy this service behind a
//! reverse proxy that overwrites (not appends to) `X-Forwarded-For`, and
//! block direct internet access; otherwise clients can spoof their IP and
//! skew per-IP bookkeeping. Requests with no IP headers all share the
//! [`UNKNOWN_IP`] key, which collectively rate-limits them - monitor for
//! high "unknown" traffic in production logs.

use std::borrow::Cow;

use axum::http::Request;

/// Fallback IP value when no client IP can be determined.
pub const UNKNOWN_IP: &str = "unknown";

/// Extract the client IP from request headers.
///
/// Checks in order (returns first match):
/// 1. `X-Forwarded-For` - first IP in the comma-separated chain
/// 2. `X-Real-IP`
/// 3. Falls back to [`UNKNOWN_IP`]
///
/// Returns `Cow<'static, str>`: borrowed for the "unknown" fallback (no
/// allocation), owned for actual IPs. Use `.into_owned()` when the value
/// must outlive the request reference.
#[inline]
pub fn extract_client_ip<B>(req: &Request<B>) -> Cow<'static, str> {
    // X-Forwarded-For format: "client, proxy1, proxy2" - first entry is the client
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first_ip) = value.split(',').next()
    {
        return Cow::Owned(first_ip.trim().to_string());
    }

    if let Some(real_ip) = req.headers().get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
    {
        return Cow::Owned(value.trim().to_string());
    }

    Cow::Borrowed(UNKNOWN_IP)
}

/// Extract the client user agent, when supplied and valid UTF-8.
#[inline]
pub fn extract_user_agent<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_extract_ip_from_xff() {
        let req = Request::builder()
            .header("x-forwarded-for", "192.168.1.1, 10.0.0.1")
            .body(Body::empty())
            .unwrap();

        assert_eq!(extract_client_ip(&req), "192.168.1.1");
    }

    #[test]
    fn test_extract_ip_from_real_ip() {
        let req = Request::builder()
            .header("x-real-ip", "192.168.1.1")
            .body(Body::empty())
            .unwrap();

        assert_eq!(extract_client_ip(&req), "192.168.1.1");
    }

    #[test]
    fn test_extract_ip_xff_priority_over_real_ip() {
        let req = Request::builder()
            .header("x-forwarded-for", "10.0.0.1")
            .header("x-real-ip", "192.168.1.1")
            .body(Body::empty())
            .unwrap();

        assert_eq!(extract_client_ip(&req), "10.0.0.1");
    }

    #[test]
    fn test_extract_ip_unknown_is_borrowed() {
        let req = Request::builder().body(Body::empty()).unwrap();

        let ip = extract_client_ip(&req);
        assert_eq!(ip, "unknown");
        assert!(matches!(ip, Cow::Borrowed(_)));
    }

    #[test]
    fn test_extract_ip_trims_whitespace() {
        let req = Request::builder()
            .header("x-forwarded-for", "  192.168.1.1  , 10.0.0.1")
            .body(Body::empty())
            .unwrap();

        assert_eq!(extract_client_ip(&req), "192.168.1.1");
    }

    #[test]
    fn test_extract_ip_xff_with_ipv6() {
        let req = Request::builder()
            .header("x-forwarded-for", "2001:db8::1, 10.0.0.1")
            .body(Body::empty())
            .unwrap();

        assert_eq!(extract_client_ip(&req), "2001:db8::1");
    }

    #[test]
    fn test_extract_user_agent() {
        let req = Request::builder()
            .header("user-agent", "dealer-sync/2.1")
            .body(Body::empty())
            .unwrap();

        assert_eq!(extract_user_agent(&req).as_deref(), Some("dealer-sync/2.1"));
    }

    #[test]
    fn test_extract_user_agent_empty_is_none() {
        let req = Request::builder()
            .header("user-agent", "")
            .body(Body::empty())
            .unwrap();

        assert_eq!(extract_user_agent(&req), None);
    }
}
