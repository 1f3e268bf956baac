//! # Shared Types Crate
//!
//! This crate contains the `MessageEnvelope<T>` wrapper, the canonical
//! serializer and HMAC signer, and the typed trading events carried by the
//! bus.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: Every cross-service type is defined here.
//! - **Envelope Integrity**: `MessageEnvelope<T>` is the sole wrapper for
//!   anything placed on a stream, and its signature covers every field.
//! - **Lossless Numbers**: Decimals travel as strings, integers are kept at
//!   arbitrary precision.

pub mod envelope;
pub mod errors;
pub mod events;
pub mod security;

pub use envelope::{now_ms, MessageEnvelope, ENVELOPE_VERSION};
pub use errors::*;
pub use events::*;
pub use security::{canonical_json, Signer};
