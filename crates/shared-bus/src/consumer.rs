//! # Consumer Loop
//!
//! Each `consume` call runs one loop per consumer:
//!
//! ```text
//! INITIALIZING ──► POLLING ◄──► PROCESSING
//!                     │
//!                     ▼ (token cancelled, or group deleted)
//!               SHUTTING_DOWN ──► STOPPED
//! ```
//!
//! Entries are processed strictly in delivery order. Per entry:
//!
//! 1. Decode the envelope (`PARSE_ERROR` → dead-letter, ack)
//! 2. Warn on envelope versions newer than this build
//! 3. Verify the signature (`INVALID_SIGNATURE` → dead-letter, ack)
//! 4. Decode the payload (`PARSE_ERROR` → dead-letter, ack)
//! 5. Run the handler: success acks; failure backs off and leaves the entry
//!    pending until the retry budget is spent (`MAX_RETRIES` → dead-letter, ack)
//!
//! A dead-letter append that fails leaves the entry pending so it is
//! reclaimed later instead of lost.

use std::collections::HashSet;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bus_telemetry::{log_stream_event, metric_inc, status, HistogramTimer};
use bus_telemetry::{CONSUME_TOTAL, PROCESSING_DURATION, REJECTIONS, RETRY_ATTEMPTS};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared_types::MessageEnvelope;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::bus::BusInner;
use crate::circuit_breaker::{backoff_delay, with_jitter, CircuitBreaker};
use crate::errors::{FailureKind, TransportError};
use crate::streams::dead_letter_stream;
use crate::transport::{StreamEntry, DATA_FIELD};

/// Base delay after a failed read.
const READ_ERROR_BASE_DELAY: Duration = Duration::from_secs(1);

/// Cap on the delay after repeated failed reads.
const READ_ERROR_MAX_DELAY: Duration = Duration::from_secs(30);

/// Ids currently queued or being processed by one consumer.
pub(crate) type InFlight = Arc<Mutex<HashSet<String>>>;

/// Settings of one `consume` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    /// Longest a poll blocks before the loop rechecks for shutdown.
    pub block: Duration,
    /// Entries fetched per poll.
    pub count: usize,
    /// Idle time after which a pending entry may be claimed.
    pub claim_min_idle: Duration,
    /// How often the pending monitor runs.
    pub pending_check_interval: Duration,
}

impl ConsumerConfig {
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            block: Duration::from_secs(5),
            count: 10,
            claim_min_idle: Duration::from_secs(5 * 60),
            pending_check_interval: Duration::from_secs(60),
        }
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn with_claim_min_idle(mut self, idle: Duration) -> Self {
        self.claim_min_idle = idle;
        self
    }

    pub fn with_pending_check_interval(mut self, interval: Duration) -> Self {
        self.pending_check_interval = interval;
        self
    }

    /// `stream:group`, the scope of breakers and retry counts.
    pub fn group_key(&self) -> String {
        format!("{}:{}", self.stream, self.group)
    }
}

/// Processes one decoded, verified message.
///
/// Returning an error schedules a retry; after the retry budget the entry
/// is dead-lettered. Handlers must be idempotent: delivery is at least once.
#[async_trait]
pub trait MessageHandler<T: Send + 'static>: Send + Sync + 'static {
    async fn handle(&self, envelope: MessageEnvelope<T>) -> anyhow::Result<()>;
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for F
where
    T: Send + 'static,
    F: Fn(MessageEnvelope<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, envelope: MessageEnvelope<T>) -> anyhow::Result<()> {
        (self)(envelope).await
    }
}

/// Handle to a running consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    config: ConsumerConfig,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub(crate) fn new(config: ConsumerConfig, token: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            config,
            token,
            task,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Ask the loop to stop after its current batch.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(
                stream = %self.config.stream,
                group = %self.config.group,
                consumer = %self.config.consumer,
                error = %e,
                "Consumer task failed"
            );
        }
    }
}

enum Outcome {
    Acked,
    Retry,
    DeadLettered,
    Unresolved,
}

/// The per-consumer read/process loop.
pub(crate) struct Consumer<T, H> {
    bus: Arc<BusInner>,
    config: ConsumerConfig,
    group_key: String,
    handler: H,
    token: CancellationToken,
    breaker: Arc<CircuitBreaker>,
    reclaimed: mpsc::Receiver<Vec<StreamEntry>>,
    in_flight: InFlight,
    _payload: PhantomData<fn() -> T>,
}

impl<T, H> Consumer<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T>,
{
    pub(crate) fn new(
        bus: Arc<BusInner>,
        config: ConsumerConfig,
        handler: H,
        token: CancellationToken,
        reclaimed: mpsc::Receiver<Vec<StreamEntry>>,
        in_flight: InFlight,
    ) -> Self {
        let group_key = config.group_key();
        let breaker = bus.consumer_breaker(&group_key);
        Self {
            bus,
            config,
            group_key,
            handler,
            token,
            breaker,
            reclaimed,
            in_flight,
            _payload: PhantomData,
        }
    }

    pub(crate) async fn run(mut self) {
        log_stream_event!(
            info,
            self.config.stream,
            "Consumer started",
            group = %self.config.group,
            consumer = %self.config.consumer
        );

        let mut read_failures = 0u32;
        loop {
            if self.token.is_cancelled() {
                break;
            }

            while let Ok(batch) = self.reclaimed.try_recv() {
                debug!(
                    stream = %self.config.stream,
                    group = %self.config.group,
                    entries = batch.len(),
                    "Processing reclaimed entries"
                );
                self.process_batch(batch).await;
            }
            if self.token.is_cancelled() {
                break;
            }

            let read = self
                .bus
                .transport
                .read_group(
                    &self.config.stream,
                    &self.config.group,
                    &self.config.consumer,
                    self.config.count,
                    self.config.block,
                )
                .await;

            match read {
                Ok(entries) => {
                    read_failures = 0;
                    if entries.is_empty() {
                        continue;
                    }
                    {
                        let mut in_flight = self.in_flight.lock();
                        for entry in &entries {
                            in_flight.insert(entry.id.clone());
                        }
                    }
                    self.process_batch(entries).await;
                }
                Err(TransportError::NoGroup { .. }) => {
                    warn!(
                        stream = %self.config.stream,
                        group = %self.config.group,
                        consumer = %self.config.consumer,
                        "Consumer group no longer exists, stopping consumer"
                    );
                    break;
                }
                Err(e) => {
                    read_failures = read_failures.saturating_add(1);
                    let delay = with_jitter(
                        backoff_delay(read_failures, READ_ERROR_BASE_DELAY, READ_ERROR_MAX_DELAY),
                        0.3,
                    );
                    warn!(
                        stream = %self.config.stream,
                        group = %self.config.group,
                        consumer = %self.config.consumer,
                        failures = read_failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Read failed, backing off"
                    );
                    if !self.pause(delay).await {
                        break;
                    }
                }
            }
        }

        log_stream_event!(
            info,
            self.config.stream,
            "Consumer stopped",
            group = %self.config.group,
            consumer = %self.config.consumer
        );
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn process_batch(&self, entries: Vec<StreamEntry>) {
        for entry in entries {
            self.process_entry(&entry).await;
            self.in_flight.lock().remove(&entry.id);
        }
    }

    async fn process_entry(&self, entry: &StreamEntry) -> Outcome {
        let Some(raw) = entry.field(DATA_FIELD) else {
            return self.reject(entry, "", FailureKind::ParseError, None).await;
        };

        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                debug!(entry_id = %entry.id, error = %e, "Entry is not valid JSON");
                return self.reject(entry, raw, FailureKind::ParseError, None).await;
            }
        };

        let header: MessageEnvelope<Value> = match serde_json::from_value(value.clone()) {
            Ok(header) => header,
            Err(e) => {
                debug!(entry_id = %entry.id, error = %e, "Entry is not an envelope");
                return self.reject(entry, raw, FailureKind::ParseError, None).await;
            }
        };

        if header.is_newer_than_supported() {
            warn!(
                stream = %self.config.stream,
                entry_id = %entry.id,
                version = header.v,
                "Envelope version newer than supported, processing anyway"
            );
        }

        if !self.bus.signer.verify_value(&value) {
            return self
                .reject(entry, raw, FailureKind::InvalidSignature, None)
                .await;
        }

        let envelope: MessageEnvelope<T> = match header.try_map_payload(serde_json::from_value) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    stream = %self.config.stream,
                    entry_id = %entry.id,
                    error = %e,
                    "Payload does not match handler type"
                );
                return self.reject(entry, raw, FailureKind::ParseError, None).await;
            }
        };

        self.dispatch(entry, raw, envelope).await
    }

    async fn dispatch(&self, entry: &StreamEntry, raw: &str, envelope: MessageEnvelope<T>) -> Outcome {
        let stream = self.config.stream.as_str();
        let retry_key = format!("{}:{}", self.group_key, entry.id);

        let result = {
            let _timer = HistogramTimer::new(&PROCESSING_DURATION.with_label_values(&[stream]));
            self.handler.handle(envelope).await
        };

        match result {
            Ok(()) => {
                self.bus.clear_retry(&retry_key);
                self.breaker.reset();
                metric_inc!(CONSUME_TOTAL, &[stream, status::SUCCESS]);
                self.ack(entry).await;
                Outcome::Acked
            }
            Err(err) => {
                let retries = self.bus.bump_retry(&retry_key);
                RETRY_ATTEMPTS
                    .with_label_values(&[stream, self.config.group.as_str()])
                    .set(f64::from(retries));
                metric_inc!(CONSUME_TOTAL, &[stream, status::ERROR]);

                let delay = self.breaker.on_failure(retries);
                warn!(
                    stream,
                    group = %self.config.group,
                    consumer = %self.config.consumer,
                    entry_id = %entry.id,
                    retries,
                    max_retries = self.bus.config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %format!("{err:#}"),
                    "Handler failed"
                );
                // Cancellation only shortens the wait; the outcome stands.
                self.pause(delay).await;

                if retries >= self.bus.config.max_retries {
                    let outcome = self
                        .reject(entry, raw, FailureKind::MaxRetries, Some(retries))
                        .await;
                    if matches!(outcome, Outcome::DeadLettered) {
                        self.bus.clear_retry(&retry_key);
                    }
                    outcome
                } else {
                    Outcome::Retry
                }
            }
        }
    }

    /// Copy an entry to the dead-letter stream and ack it.
    async fn reject(
        &self,
        entry: &StreamEntry,
        raw: &str,
        kind: FailureKind,
        retries: Option<u32>,
    ) -> Outcome {
        let stream = self.config.stream.as_str();
        let dead_letter = dead_letter_stream(stream);
        let retries_text = retries.map(|r| r.to_string());

        let mut fields: Vec<(&str, &str)> = vec![
            (DATA_FIELD, raw),
            ("error", kind.as_str()),
            ("originalId", entry.id.as_str()),
        ];
        if let Some(retries) = retries_text.as_deref() {
            fields.push(("retries", retries));
        }

        match self.bus.transport.append(&dead_letter, None, &fields).await {
            Ok(dead_letter_id) => {
                metric_inc!(REJECTIONS, &[kind.metric_reason()]);
                let consume_status = match kind {
                    FailureKind::MaxRetries => status::DEAD_LETTER,
                    FailureKind::ParseError | FailureKind::InvalidSignature => status::INVALID,
                };
                metric_inc!(CONSUME_TOTAL, &[stream, consume_status]);
                log_stream_event!(
                    warn,
                    stream,
                    "Entry dead-lettered",
                    group = %self.config.group,
                    entry_id = %entry.id,
                    dead_letter_id = %dead_letter_id,
                    reason = %kind
                );
                self.ack(entry).await;
                Outcome::DeadLettered
            }
            Err(e) => {
                error!(
                    stream,
                    group = %self.config.group,
                    entry_id = %entry.id,
                    reason = %kind,
                    error = %e,
                    "Dead-letter append failed, leaving entry pending"
                );
                Outcome::Unresolved
            }
        }
    }

    async fn ack(&self, entry: &StreamEntry) {
        if let Err(e) = self
            .bus
            .transport
            .ack(&self.config.stream, &self.config.group, &[entry.id.as_str()])
            .await
        {
            warn!(
                stream = %self.config.stream,
                group = %self.config.group,
                entry_id = %entry.id,
                error = %e,
                "Ack failed, entry will be redelivered"
            );
        }
    }
}
