//! # Error Types
//!
//! Errors surfaced by the bus and its transports, plus the classification
//! attached to dead-lettered entries.

use crate::config::ConfigError;
use shared_types::SigningError;
use std::fmt;
use thiserror::Error;

/// Errors from a stream transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No connection has been established (or it was closed).
    #[error("Not connected to broker")]
    NotConnected,

    /// The connection failed or dropped.
    #[error("Connection error: {0}")]
    Connection(String),

    /// `BUSYGROUP`: the consumer group already exists.
    #[error("Consumer group already exists")]
    GroupExists,

    /// `NOGROUP`: the consumer group (or its stream) is gone.
    #[error("Consumer group {group} does not exist on stream {stream}")]
    NoGroup { stream: String, group: String },

    /// The broker rejected the command.
    #[error("Broker command failed: {0}")]
    Command(String),
}

impl TransportError {
    /// Returns true for failures of the connection itself, as opposed to
    /// command-level rejections.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Connection(_))
    }
}

/// Errors returned by [`crate::EventBus`] operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// Invalid construction-time configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The serialized payload is over the configured limit.
    #[error("Payload of {size} bytes exceeds limit of {limit} bytes on stream {stream}")]
    PayloadTooLarge {
        stream: String,
        size: usize,
        limit: usize,
    },

    /// The payload could not be serialized.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// The envelope could not be signed.
    #[error(transparent)]
    Signing(#[from] SigningError),

    /// The broker operation failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The bus is closing and no longer accepts consumers.
    #[error("Bus is shutting down")]
    ShuttingDown,

    /// The initial connection failed and the bus is configured to abort.
    #[error("Startup failed: {0}")]
    Startup(String),

    /// Consumers did not drain before the shutdown deadline.
    #[error("Shutdown timed out with {remaining} consumers still active")]
    ShutdownTimeout { remaining: usize },
}

/// Why an entry was moved to the dead-letter stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The entry could not be decoded into an envelope or payload.
    ParseError,
    /// The envelope signature did not verify.
    InvalidSignature,
    /// The handler failed on every allowed attempt.
    MaxRetries,
}

impl FailureKind {
    /// Value written to the dead-letter `error` field.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::MaxRetries => "MAX_RETRIES",
        }
    }

    /// Value of the `reason` label on the rejection counter.
    #[must_use]
    pub fn metric_reason(&self) -> &'static str {
        match self {
            Self::ParseError => "parse_error",
            Self::InvalidSignature => "invalid_signature",
            Self::MaxRetries => "max_retries",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
