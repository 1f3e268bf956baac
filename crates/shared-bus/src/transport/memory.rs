//! In-process stream broker.
//!
//! Emulates the subset of stream semantics the bus relies on: monotonic
//! entry ids, count and id trimming, consumer groups with a last-delivered
//! cursor, per-group pending entry lists, blocking group reads and idle
//! claims. Outages and group deletion can be simulated for tests.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use shared_types::now_ms;
use tokio::sync::{broadcast, Notify};
use tracing::debug;

use super::{EntryId, StreamEntry, StreamTransport, TransportEvent, EVENT_CHANNEL_CAPACITY};
use crate::errors::TransportError;
use crate::streams::TrimStrategy;

#[derive(Debug)]
struct PendingInfo {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Debug, Default)]
struct ConsumerGroup {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingInfo>,
}

#[derive(Debug, Default)]
struct MemoryStream {
    entries: BTreeMap<EntryId, Vec<(String, String)>>,
    last_id: EntryId,
    groups: HashMap<String, ConsumerGroup>,
}

impl MemoryStream {
    fn append(&mut self, fields: Vec<(String, String)>) -> EntryId {
        let id = self.last_id.next(now_ms());
        self.entries.insert(id, fields);
        self.last_id = id;
        id
    }

    fn trim(&mut self, strategy: &TrimStrategy) -> Result<usize, TransportError> {
        let before = self.entries.len();
        match strategy {
            TrimStrategy::MaxLenApprox(max_len) => {
                while self.entries.len() as u64 > *max_len {
                    self.entries.pop_first();
                }
            }
            TrimStrategy::MinIdApprox(cutoff) => {
                let cutoff: EntryId = cutoff.parse()?;
                self.entries = self.entries.split_off(&cutoff);
            }
        }
        Ok(before - self.entries.len())
    }

    fn deliver(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, TransportError> {
        let state = self
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(stream, group))?;

        let now = Instant::now();
        let mut delivered = Vec::new();
        let range = (Bound::Excluded(state.last_delivered), Bound::Unbounded);
        for (id, fields) in self.entries.range(range).take(count.max(1)) {
            state.pending.insert(
                *id,
                PendingInfo {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            state.last_delivered = *id;
            delivered.push(StreamEntry::new(id.to_string(), fields.clone()));
        }
        Ok(delivered)
    }
}

fn no_group(stream: &str, group: &str) -> TransportError {
    TransportError::NoGroup {
        stream: stream.to_string(),
        group: group.to_string(),
    }
}

/// Stream broker living inside the process.
pub struct MemoryTransport {
    streams: Mutex<HashMap<String, MemoryStream>>,
    appended: Notify,
    connected: AtomicBool,
    available: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            streams: Mutex::new(HashMap::new()),
            appended: Notify::new(),
            connected: AtomicBool::new(false),
            available: AtomicBool::new(true),
            events,
        }
    }

    /// Simulate the broker going away or coming back.
    pub fn set_available(&self, available: bool) {
        let was = self.available.swap(available, Ordering::SeqCst);
        if was == available {
            return;
        }
        if available {
            self.connected.store(true, Ordering::SeqCst);
            let _ = self.events.send(TransportEvent::Ready);
        } else {
            self.connected.store(false, Ordering::SeqCst);
            let _ = self
                .events
                .send(TransportEvent::Error("connection lost".to_string()));
        }
        self.appended.notify_waiters();
    }

    /// Delete a consumer group. Returns false if it did not exist.
    pub fn destroy_group(&self, stream: &str, group: &str) -> bool {
        let removed = self
            .streams
            .lock()
            .get_mut(stream)
            .and_then(|s| s.groups.remove(group))
            .is_some();
        self.appended.notify_waiters();
        removed
    }

    /// Snapshot of every entry retained in `stream`, oldest first.
    pub fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        self.streams
            .lock()
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(id, fields)| StreamEntry::new(id.to_string(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Delivery count of a pending entry, if it is pending.
    pub fn deliveries(&self, stream: &str, group: &str, id: &str) -> Option<u64> {
        let id: EntryId = id.parse().ok()?;
        self.streams
            .lock()
            .get(stream)?
            .groups
            .get(group)?
            .pending
            .get(&id)
            .map(|info| info.deliveries)
    }

    fn check(&self) -> Result<(), TransportError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(TransportError::Connection("connection refused".to_string()));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamTransport for MemoryTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if !self.available.load(Ordering::SeqCst) {
            let _ = self
                .events
                .send(TransportEvent::Error("connection refused".to_string()));
            return Err(TransportError::Connection("connection refused".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Ready);
        Ok(())
    }

    async fn append(
        &self,
        stream: &str,
        trim: Option<&TrimStrategy>,
        fields: &[(&str, &str)],
    ) -> Result<String, TransportError> {
        self.check()?;
        let id = {
            let mut streams = self.streams.lock();
            let state = streams.entry(stream.to_string()).or_default();
            let id = state.append(
                fields
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            );
            if let Some(strategy) = trim {
                let trimmed = state.trim(strategy)?;
                if trimmed > 0 {
                    debug!(stream, trimmed, "Trimmed stream");
                }
            }
            id
        };
        self.appended.notify_waiters();
        Ok(id.to_string())
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), TransportError> {
        self.check()?;
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        if state.groups.contains_key(group) {
            return Err(TransportError::GroupExists);
        }
        let last_delivered = match start_id {
            "$" => state.last_id,
            id => id.parse()?,
        };
        state.groups.insert(
            group.to_string(),
            ConsumerGroup {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, TransportError> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check()?;
            let delivered = {
                let mut streams = self.streams.lock();
                let state = streams
                    .get_mut(stream)
                    .ok_or_else(|| no_group(stream, group))?;
                state.deliver(stream, group, consumer, count)?
            };
            if !delivered.is_empty() || block.is_zero() {
                return Ok(delivered);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[&str]) -> Result<u64, TransportError> {
        self.check()?;
        let mut streams = self.streams.lock();
        let Some(state) = streams.get_mut(stream).and_then(|s| s.groups.get_mut(group)) else {
            return Ok(0);
        };
        let mut acked = 0;
        for id in ids {
            let id: EntryId = id.parse()?;
            if state.pending.remove(&id).is_some() {
                acked += 1;
            }
        }
        Ok(acked)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, TransportError> {
        self.check()?;
        let mut streams = self.streams.lock();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(stream, group))?;

        let now = Instant::now();
        let idle: Vec<EntryId> = group_state
            .pending
            .iter()
            .filter(|(_, info)| now.duration_since(info.delivered_at) >= min_idle)
            .map(|(id, _)| *id)
            .take(count)
            .collect();

        let mut claimed = Vec::with_capacity(idle.len());
        for id in idle {
            match state.entries.get(&id) {
                Some(fields) => {
                    if let Some(info) = group_state.pending.get_mut(&id) {
                        info.consumer = consumer.to_string();
                        info.delivered_at = now;
                        info.deliveries += 1;
                    }
                    claimed.push(StreamEntry::new(id.to_string(), fields.clone()));
                }
                None => {
                    group_state.pending.remove(&id);
                }
            }
        }
        Ok(claimed)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, TransportError> {
        self.check()?;
        let streams = self.streams.lock();
        streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len() as u64)
            .ok_or_else(|| no_group(stream, group))
    }

    async fn length(&self, stream: &str) -> Result<u64, TransportError> {
        self.check()?;
        Ok(self
            .streams
            .lock()
            .get(stream)
            .map_or(0, |s| s.entries.len() as u64))
    }

    async fn quit(&self) -> Result<(), TransportError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Closed);
        }
        self.appended.notify_waiters();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.available.load(Ordering::SeqCst)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
