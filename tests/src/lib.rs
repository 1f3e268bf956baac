//! # Trade-Bus Test Suite
//!
//! Cross-crate scenarios run against the in-process broker.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── fixtures.rs   # Bus/consumer builders with short timings
//!     ├── delivery.rs   # Publish → consume, trimming, typed events
//!     ├── failures.rs   # Signatures, retries, dead letters, payload limits
//!     └── lifecycle.rs  # Claiming, group deletion, outages, shutdown
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p bus-tests
//! cargo test -p bus-tests integration::failures::
//! ```

#![allow(dead_code)]

pub mod integration;
