//! # Stream Transport
//!
//! The broker seam. Everything the bus needs from a stream store goes
//! through [`StreamTransport`], so the orchestrator is agnostic to whether
//! it talks to a single Redis node, a Redis cluster, or the in-process
//! emulation used by tests.
//!
//! ## Variants
//!
//! | Transport | Backing | Use |
//! |-----------|---------|-----|
//! | [`RedisTransport`] | `redis` connection manager / cluster connection | production |
//! | [`MemoryTransport`] | in-process streams, groups and PELs | tests, local runs |
//!
//! Lifecycle changes are broadcast as [`TransportEvent`]s.

mod memory;
mod redis_streams;

pub use self::memory::MemoryTransport;
pub use self::redis_streams::RedisTransport;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::errors::TransportError;
use crate::streams::TrimStrategy;

/// Capacity of the lifecycle event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Field carrying the serialized envelope.
pub const DATA_FIELD: &str = "data";

/// Lifecycle notifications emitted by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connected and accepting commands.
    Ready,
    /// A connection-class failure.
    Error(String),
    /// About to retry the connection.
    Reconnecting { attempt: u32, delay: Duration },
    /// Closed on request.
    Closed,
}

/// Connection retry policy: `min(attempt * step, max_delay)` between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub step: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            max_attempts: 20,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt).min(self.max_delay)
    }
}

/// One stream entry as delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    pub fn new(id: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// First value of `name`, if present.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Broker-assigned entry id, `<ms>-<seq>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Smallest id strictly greater than `self` at time `now_ms`.
    pub fn next(&self, now_ms: u64) -> Self {
        if now_ms > self.ms {
            Self::new(now_ms, 0)
        } else {
            Self::new(self.ms, self.seq + 1)
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = TransportError;

    /// Accepts `<ms>-<seq>` or a bare `<ms>` (sequence 0).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::Command(format!("Invalid stream ID specified: {s}"));
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        Ok(Self {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// Broker operations used by the bus.
///
/// Implementations must be safe to share between the publisher and every
/// consumer loop of a bus instance.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Establish the connection, retrying per the transport's policy.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Append one entry and return its broker-assigned id.
    async fn append(
        &self,
        stream: &str,
        trim: Option<&TrimStrategy>,
        fields: &[(&str, &str)],
    ) -> Result<String, TransportError>;

    /// Create a consumer group (and the stream if missing).
    ///
    /// Returns `TransportError::GroupExists` if the group is already there.
    async fn create_group(&self, stream: &str, group: &str, start_id: &str)
        -> Result<(), TransportError>;

    /// Read entries never delivered to the group, blocking up to `block`.
    ///
    /// An empty result means the block timed out.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, TransportError>;

    /// Acknowledge entries; returns how many were pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[&str]) -> Result<u64, TransportError>;

    /// Take ownership of pending entries idle for at least `min_idle`.
    ///
    /// Entries deleted from the stream since delivery are dropped from the
    /// pending list and not returned.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, TransportError>;

    /// Delivered but unacknowledged entries of the group.
    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, TransportError>;

    /// Entries currently retained in the stream.
    async fn length(&self, stream: &str) -> Result<u64, TransportError>;

    /// Close the connection.
    async fn quit(&self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent>;
}
