//! # Error Types
//!
//! Defines error types shared by every bus participant.

use thiserror::Error;

/// Errors that can occur while signing an envelope.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SigningError {
    /// No signing key was configured.
    #[error("Signing key is empty")]
    EmptyKey,

    /// The MAC implementation refused the key.
    #[error("Invalid signing key: {0}")]
    InvalidKey(String),

    /// The envelope could not be converted to JSON.
    #[error("Envelope serialization failed: {0}")]
    Serialization(String),
}
