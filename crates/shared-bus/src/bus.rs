//! # Event Bus
//!
//! The orchestrator: signs and appends on publish, runs consumer loops and
//! their pending monitors, folds transport events into health and metrics,
//! and coordinates shutdown.
//!
//! ## Publish
//!
//! ```text
//! payload ─► size check ─► envelope + HMAC ─► trim strategy ─► XADD
//!                │                                            │
//!                ▼                                            ▼
//!         PayloadTooLarge                      id  (or backoff + error)
//! ```
//!
//! ## Shutdown
//!
//! `close` cancels the root token (every consumer token is a child of it),
//! waits for the active set to drain, and only then closes the transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bus_telemetry::{
    metric_inc, metric_observe, register_metrics, status, CONNECTION_ERRORS, PAYLOAD_SIZE,
    PUBLISH_TOTAL, RECONNECTS, REJECTIONS,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared_types::{now_ms, BusEvent, MessageEnvelope, Signer};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::BusConfig;
use crate::consumer::{Consumer, ConsumerConfig, ConsumerHandle, InFlight, MessageHandler};
use crate::errors::{BusError, TransportError};
use crate::health::{HealthMonitor, HealthStatus};
use crate::monitor::PendingMonitor;
use crate::transport::{RedisTransport, StreamTransport, TransportEvent, DATA_FIELD};

/// Capacity of the channel carrying reclaimed entries to a consumer loop.
const RECLAIM_CHANNEL_CAPACITY: usize = 16;

/// How often `close` checks whether consumers have drained.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct ActiveConsumer {
    config: ConsumerConfig,
    token: CancellationToken,
}

/// State shared by the bus handle and its consumer tasks.
pub(crate) struct BusInner {
    pub(crate) config: BusConfig,
    pub(crate) signer: Signer,
    pub(crate) transport: Arc<dyn StreamTransport>,
    health: Arc<HealthMonitor>,
    publish_breaker: CircuitBreaker,
    publish_failures: AtomicU32,
    consumer_breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    retries: Mutex<HashMap<String, u32>>,
    active: Mutex<HashMap<u64, ActiveConsumer>>,
    next_consumer_id: AtomicU64,
    shutdown: CancellationToken,
    shutting_down: AtomicBool,
    closed: AtomicBool,
}

impl BusInner {
    /// Breaker for a `stream:group`, created on first use.
    pub(crate) fn consumer_breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        self.consumer_breakers
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(key, self.config.consumer_breaker.clone()))
            })
            .clone()
    }

    /// Increment and return the retry count of an entry.
    pub(crate) fn bump_retry(&self, key: &str) -> u32 {
        let mut retries = self.retries.lock();
        let count = retries.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub(crate) fn clear_retry(&self, key: &str) {
        self.retries.lock().remove(key);
    }

    fn register_consumer(self: &Arc<Self>, config: &ConsumerConfig, token: CancellationToken) -> ActiveGuard {
        let id = self.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        self.active.lock().insert(
            id,
            ActiveConsumer {
                config: config.clone(),
                token,
            },
        );
        ActiveGuard {
            bus: Arc::clone(self),
            id,
        }
    }
}

/// Removes a consumer from the active set however its task ends.
struct ActiveGuard {
    bus: Arc<BusInner>,
    id: u64,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.bus.active.lock().remove(&self.id);
    }
}

/// Durable, signed, at-least-once event bus.
///
/// Cheap to clone; clones share the transport, breakers and consumers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Build a bus over Redis from validated configuration.
    ///
    /// # Errors
    ///
    /// - `BusError::Config` - invalid configuration
    /// - `BusError::Startup` - the initial connect failed and
    ///   `exit_on_startup_failure` is set
    pub async fn new(config: BusConfig) -> Result<Self, BusError> {
        config.validate()?;
        let target = config.broker_target()?;
        let transport = Arc::new(RedisTransport::new(target, config.reconnect.clone()));
        Self::with_transport(config, transport).await
    }

    /// Build a bus over any transport.
    pub async fn with_transport(
        config: BusConfig,
        transport: Arc<dyn StreamTransport>,
    ) -> Result<Self, BusError> {
        config.validate()?;
        let signer = Signer::new(config.signing_key.as_bytes())?;

        if let Err(e) = register_metrics() {
            warn!(error = %e, "Metric registration failed");
        }

        let health = Arc::new(HealthMonitor::new());
        let shutdown = CancellationToken::new();
        tokio::spawn(watch_transport(
            transport.subscribe_events(),
            health.clone(),
            shutdown.clone(),
        ));

        let inner = Arc::new(BusInner {
            publish_breaker: CircuitBreaker::new("publish", config.publish_breaker.clone()),
            config,
            signer,
            transport,
            health,
            publish_failures: AtomicU32::new(0),
            consumer_breakers: Mutex::new(HashMap::new()),
            retries: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            next_consumer_id: AtomicU64::new(0),
            shutdown,
            shutting_down: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        if inner.config.auto_connect {
            match inner.transport.connect().await {
                Ok(()) => {
                    inner.health.set_connected(true);
                    info!(
                        service = inner.config.service_name.as_deref().unwrap_or("-"),
                        "Event bus connected"
                    );
                }
                Err(e) => {
                    inner.health.record_error(e.to_string());
                    if inner.config.exit_on_startup_failure {
                        error!(error = %e, "Event bus failed to connect at startup");
                        inner.shutdown.cancel();
                        return Err(BusError::Startup(e.to_string()));
                    }
                    warn!(error = %e, "Event bus starting degraded, broker unreachable");
                }
            }
        }

        Ok(Self { inner })
    }

    /// Publish a payload to `stream`, typed with the stream name.
    pub async fn publish<P: Serialize + Sync>(&self, stream: &str, payload: &P) -> Result<String, BusError> {
        self.publish_as(stream, stream, payload).await
    }

    /// Publish a typed domain event to its own stream.
    pub async fn publish_event<E: BusEvent>(&self, event: &E) -> Result<String, BusError> {
        self.publish_as(E::STREAM, E::EVENT_TYPE, event).await
    }

    /// Publish with an explicit envelope `type`.
    ///
    /// Returns the broker-assigned entry id. A transport failure is returned
    /// after the publish breaker's delay, so a caller retrying in a loop is
    /// throttled.
    pub async fn publish_as<P: Serialize + Sync>(
        &self,
        stream: &str,
        event_type: &str,
        payload: &P,
    ) -> Result<String, BusError> {
        let inner = &self.inner;

        let size = serde_json::to_vec(payload)
            .map_err(|e| BusError::Serialization(e.to_string()))?
            .len();
        let limit = inner
            .config
            .streams
            .payload_limit(stream, inner.config.max_payload_bytes);
        if size > limit {
            metric_inc!(REJECTIONS, &["payload_too_large"]);
            warn!(stream, size, limit, "Payload rejected, over size limit");
            return Err(BusError::PayloadTooLarge {
                stream: stream.to_string(),
                size,
                limit,
            });
        }

        let envelope = inner.signer.seal(MessageEnvelope::new(
            event_type,
            payload,
            inner.config.service_name.clone(),
        ))?;
        let data =
            serde_json::to_string(&envelope).map_err(|e| BusError::Serialization(e.to_string()))?;
        let trim = inner.config.streams.trim_strategy(stream, now_ms());

        match inner
            .transport
            .append(stream, trim.as_ref(), &[(DATA_FIELD, data.as_str())])
            .await
        {
            Ok(id) => {
                inner.publish_failures.store(0, Ordering::Relaxed);
                inner.publish_breaker.reset();
                inner.health.record_publish();
                metric_inc!(PUBLISH_TOTAL, &[stream, status::SUCCESS]);
                metric_observe!(PAYLOAD_SIZE, &[stream], size as f64);
                debug!(stream, entry_id = %id, envelope_id = %envelope.id, "Published");
                Ok(id)
            }
            Err(e) => {
                let attempt = inner.publish_failures.fetch_add(1, Ordering::Relaxed) + 1;
                inner.health.record_error(e.to_string());
                metric_inc!(PUBLISH_TOTAL, &[stream, status::ERROR]);

                let delay = inner.publish_breaker.on_failure(attempt);
                warn!(
                    stream,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    circuit = %inner.publish_breaker.state(),
                    error = %e,
                    "Publish failed"
                );
                tokio::select! {
                    _ = inner.shutdown.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
                Err(e.into())
            }
        }
    }

    /// Start consuming `config.stream` as `config.consumer` in `config.group`.
    ///
    /// The group is created (from the start of the stream) before this
    /// returns; the read loop and its pending monitor run in background
    /// tasks until the bus closes or the handle is stopped.
    ///
    /// # Errors
    ///
    /// - `BusError::ShuttingDown` - `close` has been called
    /// - `BusError::Transport` - the group could not be created
    pub async fn consume<T, H>(&self, config: ConsumerConfig, handler: H) -> Result<ConsumerHandle, BusError>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::SeqCst) {
            return Err(BusError::ShuttingDown);
        }

        match inner
            .transport
            .create_group(&config.stream, &config.group, "0")
            .await
        {
            Ok(()) => info!(stream = %config.stream, group = %config.group, "Created consumer group"),
            Err(TransportError::GroupExists) => {
                debug!(stream = %config.stream, group = %config.group, "Consumer group already exists")
            }
            Err(e) => return Err(e.into()),
        }

        let token = inner.shutdown.child_token();
        let guard = inner.register_consumer(&config, token.clone());

        let (reclaimed_tx, reclaimed_rx) = mpsc::channel(RECLAIM_CHANNEL_CAPACITY);
        let in_flight: InFlight = Arc::default();
        let monitor_token = token.child_token();
        tokio::spawn(
            PendingMonitor::new(
                inner.transport.clone(),
                config.clone(),
                in_flight.clone(),
                reclaimed_tx,
                monitor_token.clone(),
            )
            .run(),
        );

        let consumer = Consumer::new(
            inner.clone(),
            config.clone(),
            handler,
            token.clone(),
            reclaimed_rx,
            in_flight,
        );
        let task = tokio::spawn(async move {
            let _active = guard;
            let _monitor = monitor_token.drop_guard();
            consumer.run().await;
        });

        Ok(ConsumerHandle::new(config, token, task))
    }

    /// Consume a typed domain event from its own stream.
    pub async fn consume_event<E, H>(&self, group: &str, consumer: &str, handler: H) -> Result<ConsumerHandle, BusError>
    where
        E: BusEvent,
        H: MessageHandler<E>,
    {
        self.consume(ConsumerConfig::new(E::STREAM, group, consumer), handler)
            .await
    }

    /// Current health snapshot.
    pub fn get_health(&self) -> HealthStatus {
        let inner = &self.inner;
        inner.health.set_connected(inner.transport.is_connected());
        inner.health.status()
    }

    /// Number of consumer loops still running.
    pub fn active_consumers(&self) -> usize {
        self.inner.active.lock().len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop every consumer, wait for them to drain, then close the transport.
    ///
    /// Calling again after a timeout waits another full deadline for the
    /// remaining consumers; once the transport is closed further calls
    /// return `Ok` immediately.
    ///
    /// # Errors
    ///
    /// - `BusError::ShutdownTimeout` - consumers were still running at the
    ///   deadline; the transport is left open
    pub async fn close(&self) -> Result<(), BusError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        if !inner.shutting_down.swap(true, Ordering::SeqCst) {
            let active = inner.active.lock();
            info!(active = active.len(), "Shutting down event bus");
            for consumer in active.values() {
                debug!(
                    stream = %consumer.config.stream,
                    group = %consumer.config.group,
                    consumer = %consumer.config.consumer,
                    "Stopping consumer"
                );
                consumer.token.cancel();
            }
            drop(active);
            inner.shutdown.cancel();
        }

        self.drain().await?;

        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        inner.transport.quit().await?;
        inner.health.set_connected(false);
        info!("Event bus closed");
        Ok(())
    }

    /// Wait for the active set to empty, up to the shutdown timeout.
    async fn drain(&self) -> Result<(), BusError> {
        let inner = &self.inner;
        let deadline = tokio::time::Instant::now() + inner.config.shutdown_timeout;
        loop {
            let remaining = inner.active.lock().len();
            if remaining == 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                error!(
                    remaining,
                    timeout_ms = inner.config.shutdown_timeout.as_millis() as u64,
                    "Consumers did not drain before the shutdown deadline"
                );
                return Err(BusError::ShutdownTimeout { remaining });
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}

/// Fold transport lifecycle events into health and metrics.
async fn watch_transport(
    mut events: broadcast::Receiver<TransportEvent>,
    health: Arc<HealthMonitor>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(TransportEvent::Ready) => {
                health.set_connected(true);
                info!("Broker connection ready");
            }
            Ok(TransportEvent::Error(message)) => {
                metric_inc!(CONNECTION_ERRORS);
                health.set_connected(false);
                warn!(error = %message, "Broker connection error");
                health.record_error(message);
            }
            Ok(TransportEvent::Reconnecting { attempt, delay }) => {
                metric_inc!(RECONNECTS);
                info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnecting to broker"
                );
            }
            Ok(TransportEvent::Closed) => {
                health.set_connected(false);
                break;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Transport event watcher lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
