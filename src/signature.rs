//! Webhook signature verification with replay protection.
//!
//! Payloads are signed as `HMAC-SHA256(secret, "v0:{timestamp}:{raw_body}")`
//! and presented as a lowercase hex digest with a `v0=` prefix. Verification
//! rejects when:
//!
//! - the signature or timestamp header is missing or malformed,
//! - no signing secret is configured,
//! - the timestamp falls outside the replay window (±300 s by default),
//! - the computed digest does not match.
//!
//! Every rejection path returns the same [`MiddlewareError::InvalidSignature`]
//! so the response never reveals which check failed (no oracle). Digest
//! comparison is constant-time via `subtle`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::error::{MiddlewareError, MiddlewareResult};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex signature (`v0=<hex>`).
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Header carrying the signing timestamp, unix seconds.
pub const SIGNATURE_TIMESTAMP_HEADER: &str = "x-webhook-timestamp";

/// Default replay window: signatures older or newer than this are rejected.
pub const DEFAULT_REPLAY_WINDOW: Duration = Duration::from_secs(300);

/// Verifies signed webhook payloads against a shared secret.
#[derive(Clone)]
pub struct SignatureVerifier {
    /// `None` means signing is unconfigured; verification always fails.
    secret: Option<String>,
    replay_window: Duration,
}

impl SignatureVerifier {
    pub fn new(secret: Option<String>, replay_window: Duration) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            replay_window,
        }
    }

    /// Whether a signing secret is configured.
    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    /// Verify `signature` over `raw_body` at the current time.
    ///
    /// # Errors
    ///
    /// `MiddlewareError::InvalidSignature` on any failure; the error carries
    /// no detail about which check rejected.
    pub fn verify(
        &self,
        signature: Option<&str>,
        timestamp: Option<&str>,
        raw_body: &[u8],
    ) -> MiddlewareResult<()> {
        self.verify_at(signature, timestamp, raw_body, unix_now_secs())
    }

    /// Verify against an explicit clock, for deterministic replay tests.
    pub fn verify_at(
        &self,
        signature: Option<&str>,
        timestamp: Option<&str>,
        raw_body: &[u8],
        now_secs: i64,
    ) -> MiddlewareResult<()> {
        // The detailed reason is logged server-side only; the response
        // stays generic for every branch below.
        let Some(secret) = self.secret.as_deref() else {
            debug!("Signature rejected: no signing secret configured");
            return Err(MiddlewareError::InvalidSignature);
        };

        let Some(signature) = signature.filter(|s| !s.is_empty()) else {
            debug!("Signature rejected: signature header missing");
            return Err(MiddlewareError::InvalidSignature);
        };

        let Some(ts) = timestamp.and_then(|t| t.trim().parse::<i64>().ok()) else {
            debug!("Signature rejected: timestamp header missing or malformed");
            return Err(MiddlewareError::InvalidSignature);
        };

        let window = self.replay_window.as_secs() as i64;
        let age = now_secs.saturating_sub(ts).saturating_abs();
        if age > window {
            debug!(
                age_secs = age,
                window_secs = window,
                "Signature rejected: timestamp outside replay window"
            );
            return Err(MiddlewareError::InvalidSignature);
        }

        let provided_hex = signature.strip_prefix("v0=").unwrap_or(signature);
        let Ok(provided) = hex::decode(provided_hex) else {
            debug!("Signature rejected: signature is not valid hex");
            return Err(MiddlewareError::InvalidSignature);
        };

        let expected = compute_digest(secret, ts, raw_body)?;

        // Constant-time comparison; ct_eq also rejects length mismatches
        // without an early return.
        if bool::from(provided.ct_eq(&expected)) {
            Ok(())
        } else {
            debug!("Signature rejected: digest mismatch");
            Err(MiddlewareError::InvalidSignature)
        }
    }

    /// Produce the signature for `raw_body` at `timestamp`.
    ///
    /// Used by tests and by outbound callers that sign their own payloads.
    ///
    /// # Errors
    ///
    /// `MiddlewareError::InvalidSignature` when no secret is configured.
    pub fn sign(&self, timestamp: i64, raw_body: &[u8]) -> MiddlewareResult<String> {
        let secret = self
            .secret
            .as_deref()
            .ok_or(MiddlewareError::InvalidSignature)?;
        let digest = compute_digest(secret, timestamp, raw_body)?;
        Ok(format!("v0={}", hex::encode(digest)))
    }
}

/// `HMAC-SHA256(secret, "v0:{timestamp}:{raw_body}")`.
fn compute_digest(secret: &str, timestamp: i64, raw_body: &[u8]) -> MiddlewareResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| MiddlewareError::InvalidSignature)?;
    mac.update(format!("v0:{timestamp}:").as_bytes());
    mac.update(raw_body);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn unix_now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
