//! # Stream Configuration Registry
//!
//! Static map from stream name to retention policy and payload limit,
//! loaded at startup. The registry decides which trim arguments each
//! publish carries:
//!
//! | Policy | Trim | Wire |
//! |--------|------|------|
//! | High frequency (`approx_max_len`, or `max_len`) | count cap | `MAXLEN ~ <n>` |
//! | Retention window (`retention_ms`) | time cutoff | `MINID ~ <now - retention>-0` |
//! | Neither | none | unbounded |
//!
//! Dead-letter streams are never trimmed.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use shared_types::events::streams;

/// Suffix of the companion dead-letter stream.
pub const DEAD_LETTER_SUFFIX: &str = ":dead";

/// Name of the dead-letter stream for `stream`.
pub fn dead_letter_stream(stream: &str) -> String {
    format!("{stream}{DEAD_LETTER_SUFFIX}")
}

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Retention and size policy for one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    /// Count cap used when no approximate cap is set.
    pub max_len: Option<u64>,
    /// Approximate count cap; marks the stream as high frequency.
    pub approx_max_len: Option<u64>,
    /// Retention window in milliseconds.
    pub retention_ms: Option<u64>,
    /// Payload limit tighter than the bus-wide one.
    pub max_payload_bytes: Option<usize>,
}

impl StreamConfig {
    /// An unbounded stream.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_len: None,
            approx_max_len: None,
            retention_ms: None,
            max_payload_bytes: None,
        }
    }

    pub fn with_approx_max_len(mut self, len: u64) -> Self {
        self.approx_max_len = Some(len);
        self
    }

    pub fn with_max_len(mut self, len: u64) -> Self {
        self.max_len = Some(len);
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention_ms = Some(retention.as_millis() as u64);
        self
    }

    pub fn with_max_payload_bytes(mut self, limit: usize) -> Self {
        self.max_payload_bytes = Some(limit);
        self
    }

    /// High-frequency streams are always count-capped.
    pub fn is_high_frequency(&self) -> bool {
        self.approx_max_len.or(self.max_len).is_some()
    }

    /// Trim to apply to a publish happening at `now_ms`.
    pub fn trim_strategy(&self, now_ms: u64) -> Option<TrimStrategy> {
        if let Some(len) = self.approx_max_len.or(self.max_len) {
            return Some(TrimStrategy::MaxLenApprox(len));
        }
        self.retention_ms
            .map(|retention| TrimStrategy::MinIdApprox(format!("{}-0", now_ms.saturating_sub(retention))))
    }
}

/// Trim arguments placed before the wildcard id of an append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrimStrategy {
    /// `MAXLEN ~ <n>`
    MaxLenApprox(u64),
    /// `MINID ~ <cutoff-id>`
    MinIdApprox(String),
}

impl TrimStrategy {
    /// Command arguments in wire order.
    pub fn args(&self) -> Vec<String> {
        match self {
            Self::MaxLenApprox(len) => vec!["MAXLEN".into(), "~".into(), len.to_string()],
            Self::MinIdApprox(cutoff) => vec!["MINID".into(), "~".into(), cutoff.clone()],
        }
    }
}

impl fmt::Display for TrimStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.args().join(" "))
    }
}

/// Stream name → policy lookup.
#[derive(Debug, Clone, Default)]
pub struct StreamRegistry {
    streams: HashMap<String, StreamConfig>,
}

impl StreamRegistry {
    /// A registry with no configured streams; everything is unbounded.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Policies for the trading streams.
    pub fn with_defaults() -> Self {
        Self::empty()
            .with_stream(StreamConfig::new(streams::ORDER_REQUEST))
            .with_stream(StreamConfig::new(streams::ORDER_UPDATE).with_retention(days(7)))
            .with_stream(StreamConfig::new(streams::POSITION_UPDATE).with_retention(days(7)))
            .with_stream(
                StreamConfig::new(streams::PRICE_UPDATE)
                    .with_approx_max_len(10_000)
                    .with_max_payload_bytes(4 * 1024),
            )
            .with_stream(StreamConfig::new(streams::FUNDING_RATE).with_retention(days(30)))
            .with_stream(StreamConfig::new(streams::TRANSACTION))
    }

    /// Add or replace a stream policy.
    pub fn with_stream(mut self, config: StreamConfig) -> Self {
        self.insert(config);
        self
    }

    pub fn insert(&mut self, config: StreamConfig) {
        self.streams.insert(config.name.clone(), config);
    }

    pub fn get(&self, stream: &str) -> Option<&StreamConfig> {
        self.streams.get(stream)
    }

    /// Trim for a publish to `stream` at `now_ms`. Unknown and dead-letter
    /// streams are unbounded.
    pub fn trim_strategy(&self, stream: &str, now_ms: u64) -> Option<TrimStrategy> {
        if stream.ends_with(DEAD_LETTER_SUFFIX) {
            return None;
        }
        self.get(stream).and_then(|config| config.trim_strategy(now_ms))
    }

    /// Effective payload limit: the stream's own limit if tighter.
    pub fn payload_limit(&self, stream: &str, default_limit: usize) -> usize {
        self.get(stream)
            .and_then(|config| config.max_payload_bytes)
            .map_or(default_limit, |limit| limit.min(default_limit))
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

fn days(n: u64) -> Duration {
    Duration::from_millis(n * DAY_MS)
}
