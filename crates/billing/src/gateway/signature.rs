//! Webhook signature verification
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac>[,v1=...]`. The HMAC-SHA256
//! covers `"<t>.<payload>"`. Several `v1` entries may be present while a
//! secret is being rotated; any one of them matching is enough.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Default replay window
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Verify `signature` against `payload`. Fails closed.
pub fn verify(
    payload: &str,
    signature: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> BillingResult<()> {
    if secret.is_empty() {
        tracing::error!("Webhook secret is not configured, rejecting event");
        return Err(BillingError::InvalidSignature);
    }

    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in signature.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            match key {
                "t" => timestamp = value.parse().ok(),
                "v1" => candidates.push(value),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::InvalidSignature
    })?;

    if candidates.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::InvalidSignature);
    }

    if now.abs_diff(timestamp) > tolerance_secs.unsigned_abs() {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::InvalidSignature);
    }

    let expected = compute(payload, secret, timestamp)?;

    let matched = candidates
        .iter()
        .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));

    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::InvalidSignature);
    }

    Ok(())
}

/// Hex HMAC for `"<timestamp>.<payload>"`
pub fn compute(payload: &str, secret: &str, timestamp: i64) -> BillingResult<String> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| BillingError::InvalidSignature)?;
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Build a header the way the gateway does. Used by tests and local tooling.
pub fn sign(payload: &str, secret: &str, timestamp: i64) -> BillingResult<String> {
    Ok(format!("t={timestamp},v1={}", compute(payload, secret, timestamp)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const NOW: i64 = 1_700_000_000;

    #[test]
    fn test_valid_signature() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, SECRET, NOW).unwrap();
        assert!(verify(payload, &header, SECRET, DEFAULT_TOLERANCE_SECS, NOW + 10).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let header = sign(r#"{"id":"evt_1"}"#, SECRET, NOW).unwrap();
        let result = verify(r#"{"id":"evt_2"}"#, &header, SECRET, DEFAULT_TOLERANCE_SECS, NOW);
        assert!(matches!(result, Err(BillingError::InvalidSignature)));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = "{}";
        let header = sign(payload, SECRET, NOW).unwrap();
        let result = verify(payload, &header, SECRET, DEFAULT_TOLERANCE_SECS, NOW + 301);
        assert!(matches!(result, Err(BillingError::InvalidSignature)));
    }

    #[test]
    fn test_extreme_timestamps_rejected() {
        let payload = "{}";
        for timestamp in [i64::MIN, i64::MAX, -1] {
            let header = sign(payload, SECRET, timestamp).unwrap();
            let result = verify(payload, &header, SECRET, DEFAULT_TOLERANCE_SECS, NOW);
            assert!(matches!(result, Err(BillingError::InvalidSignature)));
        }
    }

    #[test]
    fn test_missing_secret_fails_closed() {
        let payload = "{}";
        let header = sign(payload, SECRET, NOW).unwrap();
        assert!(matches!(
            verify(payload, &header, "", DEFAULT_TOLERANCE_SECS, NOW),
            Err(BillingError::InvalidSignature)
        ));
    }

    #[test]
    fn test_missing_parts_rejected() {
        assert!(verify("{}", "v1=abc", SECRET, DEFAULT_TOLERANCE_SECS, NOW).is_err());
        assert!(verify("{}", &format!("t={NOW}"), SECRET, DEFAULT_TOLERANCE_SECS, NOW).is_err());
        assert!(verify("{}", "", SECRET, DEFAULT_TOLERANCE_SECS, NOW).is_err());
    }

    #[test]
    fn test_rotated_secret_accepts_any_v1() {
        let payload = "{}";
        let good = compute(payload, SECRET, NOW).unwrap();
        let header = format!("t={NOW},v1=deadbeef,v1={good}");
        assert!(verify(payload, &header, SECRET, DEFAULT_TOLERANCE_SECS, NOW).is_ok());
    }
}
