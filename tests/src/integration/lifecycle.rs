//! # Lifecycle Scenarios
//!
//! Crash recovery through claiming, group deletion, broker outages and
//! graceful shutdown.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use shared_bus::{BusError, StreamTransport};
    use shared_types::MessageEnvelope;

    use crate::integration::fixtures::{
        drained, eventually, fast_config, fast_consumer, start_bus, KEY, WAIT,
    };

    #[tokio::test]
    async fn test_survivor_claims_abandoned_entries() {
        let (bus, transport) = start_bus(fast_config(KEY)).await;
        transport.create_group("positions", "risk", "0").await.unwrap();
        for n in 0..2 {
            bus.publish("positions", &json!({ "n": n })).await.unwrap();
        }

        // c0 reads both entries, then dies without acknowledging.
        let abandoned = transport
            .read_group("positions", "risk", "c0", 10, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(abandoned.len(), 2);
        assert_eq!(transport.pending_count("positions", "risk").await.unwrap(), 2);

        let handled = Arc::new(Mutex::new(Vec::<u64>::new()));
        let sink = handled.clone();
        bus.consume::<Value, _>(
            fast_consumer("positions", "risk", "c1"),
            move |envelope: MessageEnvelope<Value>| {
                let sink = sink.clone();
                async move {
                    sink.lock().push(envelope.payload["n"].as_u64().unwrap_or(u64::MAX));
                    Ok::<(), anyhow::Error>(())
                }
            },
        )
        .await
        .unwrap();

        eventually("abandoned entries to be reclaimed", || handled.lock().len() == 2).await;
        drained(&transport, "positions", "risk").await;

        let mut seen = handled.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1]);
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_deleted_group_stops_consumer() {
        let (bus, transport) = start_bus(fast_config(KEY)).await;
        let handle = bus
            .consume::<Value, _>(fast_consumer("orders.archive", "archiver", "c1"), |_envelope: MessageEnvelope<Value>| async {
                Ok::<(), anyhow::Error>(())
            })
            .await
            .unwrap();
        assert_eq!(bus.active_consumers(), 1);

        assert!(transport.destroy_group("orders.archive", "archiver"));

        eventually("consumer to stop", || handle.is_finished()).await;
        assert_eq!(bus.active_consumers(), 0);
        assert!(!bus.is_shutting_down());
        handle.join().await;
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_stopping_one_consumer_leaves_others() {
        let (bus, transport) = start_bus(fast_config(KEY)).await;
        let calls = Arc::new(AtomicU32::new(0));

        let first = bus
            .consume::<Value, _>(fast_consumer("fills", "g", "c1"), |_envelope: MessageEnvelope<Value>| async {
                Ok::<(), anyhow::Error>(())
            })
            .await
            .unwrap();
        let counter = calls.clone();
        bus.consume::<Value, _>(fast_consumer("fills", "g", "c2"), move |_envelope: MessageEnvelope<Value>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), anyhow::Error>(()) }
        })
        .await
        .unwrap();

        first.stop();
        tokio::time::timeout(WAIT, first.join()).await.unwrap();
        assert_eq!(bus.active_consumers(), 1);

        bus.publish("fills", &json!({"fill": 1})).await.unwrap();
        eventually("remaining consumer to handle the fill", || calls.load(Ordering::SeqCst) == 1).await;
        drained(&transport, "fills", "g").await;
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_handler() {
        let (bus, transport) = start_bus(fast_config(KEY)).await;
        let started = Arc::new(AtomicU32::new(0));
        let finished = Arc::new(AtomicU32::new(0));
        let (on_start, on_finish) = (started.clone(), finished.clone());

        bus.consume::<Value, _>(fast_consumer("withdrawals", "payout", "c1"), move |_envelope: MessageEnvelope<Value>| {
            let (on_start, on_finish) = (on_start.clone(), on_finish.clone());
            async move {
                on_start.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(150)).await;
                on_finish.fetch_add(1, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        })
        .await
        .unwrap();

        bus.publish("withdrawals", &json!({"amount": "5"})).await.unwrap();
        eventually("handler to start", || started.load(Ordering::SeqCst) == 1).await;

        tokio::time::timeout(WAIT, bus.close()).await.unwrap().unwrap();

        // The handler ran to completion and its ack landed before the
        // connection closed.
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(bus.active_consumers(), 0);
        assert!(!transport.is_connected());
        assert!(!bus.get_health().connected);

        // Closing twice is harmless.
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_timeout_reports_stuck_consumers() {
        let mut config = fast_config(KEY);
        config.shutdown_timeout = Duration::from_millis(200);
        let (bus, transport) = start_bus(config).await;
        let started = Arc::new(AtomicU32::new(0));
        let on_start = started.clone();

        bus.consume::<Value, _>(fast_consumer("stuck", "g", "c1"), move |_envelope: MessageEnvelope<Value>| {
            on_start.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<(), anyhow::Error>(())
            }
        })
        .await
        .unwrap();

        bus.publish("stuck", &json!({})).await.unwrap();
        eventually("handler to start", || started.load(Ordering::SeqCst) == 1).await;

        let err = bus.close().await.unwrap_err();
        assert!(matches!(err, BusError::ShutdownTimeout { remaining: 1 }));
        // The connection stays open while a consumer is still running.
        assert!(transport.is_connected());
        assert!(bus.is_shutting_down());
    }

    #[tokio::test]
    async fn test_outage_and_recovery() {
        let (bus, transport) = start_bus(fast_config(KEY)).await;
        let handled = Arc::new(AtomicU32::new(0));
        let counter = handled.clone();

        bus.consume::<Value, _>(fast_consumer("accounts", "g", "c1"), move |_envelope: MessageEnvelope<Value>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), anyhow::Error>(()) }
        })
        .await
        .unwrap();
        assert!(bus.get_health().healthy);

        transport.set_available(false);
        let err = bus.publish("accounts", &json!({"id": 1})).await.unwrap_err();
        assert!(matches!(err, BusError::Transport(ref e) if e.is_connection()));
        let health = bus.get_health();
        assert!(!health.connected);
        assert!(!health.healthy);
        assert!(health.last_error.is_some());

        transport.set_available(true);
        bus.publish("accounts", &json!({"id": 2})).await.unwrap();
        eventually("consumer to resume after the outage", || handled.load(Ordering::SeqCst) == 1).await;

        // A publish after the error restores health.
        let health = bus.get_health();
        assert!(health.connected);
        assert!(health.healthy);
        assert!(health.last_publish_at >= health.last_error_at);
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_degraded_start_recovers() {
        let transport = Arc::new(shared_bus::MemoryTransport::new());
        transport.set_available(false);
        let mut config = fast_config(KEY);
        config.exit_on_startup_failure = false;

        let bus = shared_bus::EventBus::with_transport(config, transport.clone())
            .await
            .unwrap();
        assert!(!bus.get_health().healthy);

        // The broker comes up later; publishes start succeeding.
        transport.set_available(true);
        bus.publish("late.start", &json!({"ok": true})).await.unwrap();
        assert!(bus.get_health().healthy);
        assert_eq!(transport.length("late.start").await.unwrap(), 1);
    }
}
