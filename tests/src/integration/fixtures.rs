//! Shared builders for the integration scenarios.
//!
//! Every delay in the bus is shortened so retries, claims and shutdown
//! complete in milliseconds.

use std::sync::Arc;
use std::time::Duration;

use shared_bus::{BusConfig, ConsumerConfig, EventBus, MemoryTransport, StreamTransport};

pub const KEY: &str = "integration-signing-key";

/// Upper bound on any single wait in a scenario.
pub const WAIT: Duration = Duration::from_secs(5);

/// Bus settings with millisecond backoffs.
pub fn fast_config(key: &str) -> BusConfig {
    let mut config = BusConfig::new(key).with_service_name("bus-tests");
    for breaker in [&mut config.publish_breaker, &mut config.consumer_breaker] {
        breaker.base_delay = Duration::from_millis(5);
        breaker.max_delay = Duration::from_millis(20);
        breaker.open_delay = Duration::from_millis(50);
        breaker.open_duration = Duration::from_millis(100);
    }
    config.shutdown_timeout = Duration::from_secs(2);
    config
}

/// Consumer settings that poll, check and claim quickly.
pub fn fast_consumer(stream: &str, group: &str, consumer: &str) -> ConsumerConfig {
    ConsumerConfig::new(stream, group, consumer)
        .with_block(Duration::from_millis(50))
        .with_claim_min_idle(Duration::from_millis(40))
        .with_pending_check_interval(Duration::from_millis(25))
}

pub async fn start_bus(config: BusConfig) -> (EventBus, Arc<MemoryTransport>) {
    let transport = Arc::new(MemoryTransport::new());
    let bus = attach_bus(config, &transport).await;
    (bus, transport)
}

/// A second bus instance sharing the same broker.
pub async fn attach_bus(config: BusConfig, transport: &Arc<MemoryTransport>) -> EventBus {
    EventBus::with_transport(config, transport.clone() as Arc<dyn StreamTransport>)
        .await
        .expect("bus starts over the in-process broker")
}

/// Poll `check` until it holds, failing the test after [`WAIT`].
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let result = tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

/// Wait until the group has no pending entries.
pub async fn drained(transport: &MemoryTransport, stream: &str, group: &str) {
    let result = tokio::time::timeout(WAIT, async {
        loop {
            match transport.pending_count(stream, group).await {
                Ok(0) => break,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    })
    .await;
    assert!(result.is_ok(), "{stream}/{group} still has pending entries");
}
