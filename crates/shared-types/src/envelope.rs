//! # `MessageEnvelope` Envelope
//!
//! The universal wrapper for every payload placed on a bus stream.
//!
//! ## Wire Shape
//!
//! ```text
//! { "id": "<uuidv7>", "type": "order.request", "ts": 1718000000000,
//!   "payload": { ... }, "v": 1, "producer": "order-service", "sig": "<hex>" }
//! ```
//!
//! - **Identity**: `id` is time-sortable (UUIDv7) and unique per message.
//! - **Versioning**: `v` is a simple schema tag; consumers log and still
//!   process envelopes newer than they understand.
//! - **Integrity**: `sig` is an HMAC over every other field, computed on the
//!   canonical serialization (see [`crate::security`]).

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Envelope schema version produced by this crate.
pub const ENVELOPE_VERSION: u64 = 1;

/// Signed wrapper around a domain payload.
///
/// Immutable once sealed: the signature covers every field, so any mutation
/// after [`crate::security::Signer::seal`] makes verification fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    /// Time-sortable unique identifier.
    pub id: String,

    /// Event type (the stream name unless a typed event supplies its own).
    #[serde(rename = "type")]
    pub event_type: String,

    /// Creation time, milliseconds since the Unix epoch.
    pub ts: u64,

    /// The domain payload.
    pub payload: T,

    /// Envelope schema version.
    pub v: u64,

    /// Name of the producing service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer: Option<String>,

    /// Hex HMAC-SHA256 over the canonical envelope without this field.
    #[serde(default)]
    pub sig: String,
}

impl<T> MessageEnvelope<T> {
    /// Build an unsigned envelope stamped with a fresh id and the current time.
    pub fn new(event_type: impl Into<String>, payload: T, producer: Option<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            event_type: event_type.into(),
            ts: now_ms(),
            payload,
            v: ENVELOPE_VERSION,
            producer,
            sig: String::new(),
        }
    }

    /// Returns true once a signature has been attached.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        !self.sig.is_empty()
    }

    /// Returns true if this envelope was produced by a newer schema.
    #[must_use]
    pub fn is_newer_than_supported(&self) -> bool {
        self.v > ENVELOPE_VERSION
    }

    /// Convert the payload, keeping the header. Used after verification to
    /// decode a generic payload into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` fails with; the envelope is consumed either way.
    pub fn try_map_payload<U, E>(
        self,
        f: impl FnOnce(T) -> Result<U, E>,
    ) -> Result<MessageEnvelope<U>, E> {
        Ok(MessageEnvelope {
            id: self.id,
            event_type: self.event_type,
            ts: self.ts,
            payload: f(self.payload)?,
            v: self.v,
            producer: self.producer,
            sig: self.sig,
        })
    }
}

/// Returns the current Unix time in milliseconds.
///
/// Returns 0 if the system clock is before the epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
