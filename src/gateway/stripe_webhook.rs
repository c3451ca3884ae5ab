//! Stripe webhook events: signature check and the event subset we act on.
//!
//! # Signature
//!
//! Stripe sends `Stripe-Signature: t=<unix>,v1=<hex>[,v1=<hex>...]`. Each
//! `v1` is an HMAC-SHA256 of `"{t}.{raw body}"` keyed with the endpoint
//! secret. Events older than [`SIGNATURE_TOLERANCE_SECS`] are rejected.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Signature header is malformed")]
    Malformed,

    #[error("No signature matches the payload")]
    Mismatch,

    #[error("Signature timestamp outside tolerance")]
    Stale,
}

/// Verify a `Stripe-Signature` header against the raw request body.
pub fn verify_signature(
    secret: &str,
    header: &str,
    payload: &[u8],
    now: i64,
) -> Result<(), SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => {
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed);
    }

    let matched = signatures.iter().any(|signature| {
        let mut mac = prefixed_mac(secret, timestamp);
        mac.update(payload);
        mac.verify_slice(signature).is_ok()
    });
    if !matched {
        return Err(SignatureError::Mismatch);
    }

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(SignatureError::Stale);
    }

    Ok(())
}

/// Build a `Stripe-Signature` header value for `payload` signed at `timestamp`.
pub fn sign(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mut mac = prefixed_mac(secret, timestamp);
    mac.update(payload);
    format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    )
}

/// MAC primed with the `"{t}."` prefix; the caller feeds the body.
fn prefixed_mac(secret: &str, timestamp: i64) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC key length is valid");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac
}

/// Envelope of a Stripe event. Only payment intent events are read.
#[derive(Debug, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Deserialize)]
pub struct StripeEventData {
    pub object: StripeEventObject,
}

#[derive(Debug, Deserialize)]
pub struct StripeEventObject {
    pub id: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl StripeEvent {
    /// Invoice id stamped on the intent when it was created.
    pub fn invoice_id(&self) -> Option<i64> {
        self.data
            .object
            .metadata
            .get("invoice_id")
            .and_then(|id| id.parse().ok())
    }
}
