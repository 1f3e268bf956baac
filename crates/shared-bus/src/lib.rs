//! # Shared Bus - Durable Event Bus for Trading Services
//!
//! Propagates domain events between independently deployed services over
//! broker streams, with at-least-once delivery.
//!
//! ## Guarantees
//!
//! - **Integrity:** every entry carries a `MessageEnvelope<T>` signed with
//!   HMAC-SHA256 over canonical JSON; unverifiable entries never reach a
//!   handler
//! - **Delivery:** entries are acked only after the handler succeeds or the
//!   entry is durably dead-lettered to `<stream>:dead`
//! - **Backpressure:** per-stream count or time trimming on every append
//! - **Isolation:** circuit breakers per publish path and per `stream:group`
//!
//! ## Flow
//!
//! ```text
//! ┌──────────────┐  publish()   ┌──────────────┐   consume()   ┌──────────────┐
//! │  Producer    │ ───────────► │   Stream     │ ────────────► │  Consumer    │
//! │  service     │   XADD       │  (broker)    │  XREADGROUP   │  group       │
//! └──────────────┘              └──────┬───────┘               └──────┬───────┘
//!                                      │   XCLAIM (idle entries)      │
//!                                      └──────────────────────────────┘
//!                                      failures ──► <stream>:dead
//! ```

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod bus;
pub mod circuit_breaker;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod health;
mod monitor;
pub mod streams;
pub mod transport;

// Re-export main types
pub use bus::EventBus;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{BrokerTarget, BusConfig, ConfigError};
pub use consumer::{ConsumerConfig, ConsumerHandle, MessageHandler};
pub use errors::{BusError, FailureKind, TransportError};
pub use health::HealthStatus;
pub use streams::{dead_letter_stream, StreamConfig, StreamRegistry, TrimStrategy};
pub use transport::{
    MemoryTransport, RedisTransport, ReconnectPolicy, StreamEntry, StreamTransport,
    TransportEvent,
};
