//! Cross-crate scenarios over `MemoryTransport`.

pub mod fixtures;

mod delivery;
mod failures;
mod lifecycle;
