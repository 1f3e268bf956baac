//! Pending-entry monitor.
//!
//! Runs beside each consumer loop. On every tick it publishes the group's
//! pending count, claims entries that have sat idle past the claim
//! threshold (whether abandoned by a crashed consumer or left pending by a
//! failed handler) and hands them to the loop, then refreshes the stream
//! length gauge. Failures are logged and retried on the next tick.

use std::sync::Arc;

use bus_telemetry::{PENDING_MESSAGES, STREAM_LENGTH};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::consumer::{ConsumerConfig, InFlight};
use crate::errors::TransportError;
use crate::transport::{StreamEntry, StreamTransport};

/// Most entries claimed per tick.
pub const CLAIM_BATCH: usize = 100;

pub(crate) struct PendingMonitor {
    transport: Arc<dyn StreamTransport>,
    config: ConsumerConfig,
    in_flight: InFlight,
    reclaimed: mpsc::Sender<Vec<StreamEntry>>,
    token: CancellationToken,
}

impl PendingMonitor {
    pub(crate) fn new(
        transport: Arc<dyn StreamTransport>,
        config: ConsumerConfig,
        in_flight: InFlight,
        reclaimed: mpsc::Sender<Vec<StreamEntry>>,
        token: CancellationToken,
    ) -> Self {
        Self {
            transport,
            config,
            in_flight,
            reclaimed,
            token,
        }
    }

    pub(crate) async fn run(self) {
        let mut interval = tokio::time::interval(self.config.pending_check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            stream = %self.config.stream,
            group = %self.config.group,
            interval_ms = self.config.pending_check_interval.as_millis() as u64,
            "Pending monitor started"
        );

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.check().await {
                        warn!(
                            stream = %self.config.stream,
                            group = %self.config.group,
                            error = %e,
                            "Pending check failed"
                        );
                    }
                }
            }
        }

        debug!(
            stream = %self.config.stream,
            group = %self.config.group,
            "Pending monitor stopped"
        );
    }

    async fn check(&self) -> Result<(), TransportError> {
        let stream = self.config.stream.as_str();
        let group = self.config.group.as_str();

        let pending = self.transport.pending_count(stream, group).await?;
        PENDING_MESSAGES
            .with_label_values(&[stream, group])
            .set(pending as f64);

        if pending > 0 {
            let claimed = self
                .transport
                .claim(
                    stream,
                    group,
                    &self.config.consumer,
                    self.config.claim_min_idle,
                    CLAIM_BATCH,
                )
                .await?;

            // Entries already queued or in the handler stay with the loop.
            let fresh: Vec<StreamEntry> = {
                let mut in_flight = self.in_flight.lock();
                claimed
                    .into_iter()
                    .filter(|entry| in_flight.insert(entry.id.clone()))
                    .collect()
            };

            if !fresh.is_empty() {
                info!(
                    stream,
                    group,
                    consumer = %self.config.consumer,
                    claimed = fresh.len(),
                    "Claimed idle pending entries"
                );
                tokio::select! {
                    _ = self.token.cancelled() => return Ok(()),
                    sent = self.reclaimed.send(fresh) => {
                        if sent.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }

        let length = self.transport.length(stream).await?;
        STREAM_LENGTH.with_label_values(&[stream]).set(length as f64);
        Ok(())
    }
}
