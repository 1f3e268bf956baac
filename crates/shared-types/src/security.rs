//! # Envelope Signing
//!
//! This module provides the **single, authoritative implementation** of
//! envelope integrity for every service on the bus.
//!
//! ## Security Properties
//!
//! - **HMAC-SHA256 Signatures**: Envelopes are signed with a shared secret
//!   per deployment. A consumer holding a different key rejects 100% of
//!   messages, which isolates tenants sharing a broker.
//! - **Canonical Serialization**: Object keys are sorted recursively and the
//!   JSON is emitted compactly, so the signature is independent of field
//!   order. Verification recomputes it from deserialized data.
//! - **Constant-Time Comparison**: Signature checks go through
//!   `Mac::verify_slice`.

use crate::envelope::MessageEnvelope;
use crate::errors::SigningError;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Name of the signature field, excluded from the signed bytes.
pub const SIGNATURE_FIELD: &str = "sig";

/// Length of a hex-encoded HMAC-SHA256 signature.
pub const SIGNATURE_HEX_LEN: usize = 64;

// =============================================================================
// CANONICAL SERIALIZATION
// =============================================================================

/// Serialize a JSON value canonically.
///
/// Two logically identical values always produce identical output:
/// object keys are sorted at every depth, arrays keep their order, and
/// numbers keep their exact textual form.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    // Serializing a str cannot fail.
    match serde_json::to_string(s) {
        Ok(escaped) => out.push_str(&escaped),
        Err(_) => out.push_str("\"\""),
    }
}

// =============================================================================
// SIGNER
// =============================================================================

/// Signs and verifies envelopes with a shared secret.
#[derive(Clone)]
pub struct Signer {
    key: Vec<u8>,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("key", &"<redacted>")
            .finish()
    }
}

impl Signer {
    /// Create a signer from a shared secret.
    ///
    /// # Errors
    ///
    /// - `SigningError::EmptyKey` - the secret is empty
    pub fn new(key: impl AsRef<[u8]>) -> Result<Self, SigningError> {
        let key = key.as_ref();
        if key.is_empty() {
            return Err(SigningError::EmptyKey);
        }
        Ok(Self { key: key.to_vec() })
    }

    fn mac(&self) -> Result<HmacSha256, SigningError> {
        HmacSha256::new_from_slice(&self.key).map_err(|e| SigningError::InvalidKey(e.to_string()))
    }

    /// Compute the hex signature of a value, ignoring any top-level `sig`.
    ///
    /// # Errors
    ///
    /// - `SigningError::Serialization` - the value cannot be represented as JSON
    pub fn sign<S: Serialize>(&self, unsigned: &S) -> Result<String, SigningError> {
        let mut value =
            serde_json::to_value(unsigned).map_err(|e| SigningError::Serialization(e.to_string()))?;
        strip_signature(&mut value);

        let mut mac = self.mac()?;
        mac.update(canonical_json(&value).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Attach a signature to an envelope.
    ///
    /// # Errors
    ///
    /// Propagates [`Signer::sign`] failures.
    pub fn seal<T: Serialize>(
        &self,
        mut envelope: MessageEnvelope<T>,
    ) -> Result<MessageEnvelope<T>, SigningError> {
        envelope.sig.clear();
        envelope.sig = self.sign(&envelope)?;
        Ok(envelope)
    }

    /// Verify an envelope. Never errors: any failure yields `false`.
    #[must_use]
    pub fn verify<T: Serialize>(&self, envelope: &MessageEnvelope<T>) -> bool {
        match serde_json::to_value(envelope) {
            Ok(value) => self.verify_value(&value),
            Err(_) => false,
        }
    }

    /// Verify an envelope in raw JSON form, as read off the wire.
    ///
    /// Fields unknown to this version still participate in the signature,
    /// so newer producers verify against older consumers.
    #[must_use]
    pub fn verify_value(&self, value: &Value) -> bool {
        let Some(sig_hex) = value.get(SIGNATURE_FIELD).and_then(Value::as_str) else {
            return false;
        };
        // Only the exact encoding `sign` produces is accepted.
        if !is_signature_hex(sig_hex) {
            return false;
        }
        let Ok(expected) = hex::decode(sig_hex) else {
            return false;
        };

        let mut unsigned = value.clone();
        strip_signature(&mut unsigned);

        let Ok(mut mac) = self.mac() else {
            return false;
        };
        mac.update(canonical_json(&unsigned).as_bytes());

        // Constant-time comparison
        mac.verify_slice(&expected).is_ok()
    }
}

/// 64 lower-case hex digits, the output of `hex::encode` on a SHA-256 MAC.
fn is_signature_hex(sig: &str) -> bool {
    sig.len() == SIGNATURE_HEX_LEN && sig.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn strip_signature(value: &mut Value) {
    if let Value::Object(map) = value {
        map.remove(SIGNATURE_FIELD);
    }
}
