//! Fuzz the signature verifier against arbitrary header and body inputs.
//!
//! Verification must never panic: every malformed signature, timestamp, or
//! body combination resolves to a clean accept or reject.

#![no_main]

use std::time::Duration;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tenantguard::signature::SignatureVerifier;

#[derive(Arbitrary, Debug)]
struct Input<'a> {
    secret: Option<&'a str>,
    signature: Option<&'a str>,
    timestamp: Option<&'a str>,
    body: &'a [u8],
    now_secs: i64,
    replay_window_secs: u16,
}

fuzz_target!(|input: Input<'_>| {
    let verifier = SignatureVerifier::new(
        input.secret.map(str::to_string),
        Duration::from_secs(u64::from(input.replay_window_secs).max(1)),
    );

    let _ = verifier.verify_at(input.signature, input.timestamp, input.body, input.now_secs);
});
