//! # Failure Scenarios
//!
//! Entries that cannot be trusted, decoded or handled end up on
//! `<stream>:dead` exactly once, and the source entry is acknowledged.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{json, Value};
    use shared_bus::{dead_letter_stream, BusError, StreamTransport};
    use shared_types::events::streams;
    use shared_types::{MessageEnvelope, OrderRequest, Signer, ENVELOPE_VERSION};

    use crate::integration::fixtures::{
        attach_bus, drained, eventually, fast_config, fast_consumer, start_bus, KEY,
    };

    fn counting_handler(
        calls: &Arc<AtomicU32>,
        fail_first: u32,
    ) -> impl Fn(MessageEnvelope<Value>) -> std::future::Ready<anyhow::Result<()>> + Send + Sync + 'static {
        let calls = calls.clone();
        move |_envelope: MessageEnvelope<Value>| {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if call <= fail_first {
                Err(anyhow::anyhow!("downstream unavailable (attempt {call})"))
            } else {
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_foreign_key_is_dead_lettered() {
        let (consumer_bus, transport) = start_bus(fast_config(KEY)).await;
        let producer_bus = attach_bus(fast_config("some-other-key"), &transport).await;
        let calls = Arc::new(AtomicU32::new(0));

        consumer_bus
            .consume::<Value, _>(
                fast_consumer(streams::ORDER_REQUEST, "g1", "c1"),
                counting_handler(&calls, 0),
            )
            .await
            .unwrap();

        let original_id = producer_bus
            .publish(streams::ORDER_REQUEST, &json!({"orderId": "o1", "size": "100"}))
            .await
            .unwrap();

        let dead = dead_letter_stream(streams::ORDER_REQUEST);
        eventually("signature rejection", || transport.entries(&dead).len() == 1).await;
        drained(&transport, streams::ORDER_REQUEST, "g1").await;

        let entry = &transport.entries(&dead)[0];
        assert_eq!(entry.field("error"), Some("INVALID_SIGNATURE"));
        assert_eq!(entry.field("originalId"), Some(original_id.as_str()));
        assert!(entry.field("retries").is_none());

        // The dead letter carries the raw entry for inspection.
        let data: Value = serde_json::from_str(entry.field("data").unwrap()).unwrap();
        assert_eq!(data["payload"]["orderId"], "o1");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        consumer_bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_tampered_payload_is_dead_lettered() {
        let (bus, transport) = start_bus(fast_config(KEY)).await;
        let calls = Arc::new(AtomicU32::new(0));
        bus.consume::<Value, _>(
            fast_consumer("ledger.tamper", "audit", "c1"),
            counting_handler(&calls, 0),
        )
        .await
        .unwrap();

        // Sign one entry through a second stream, then replay it altered.
        bus.publish("ledger.source", &json!({"amount": "10"})).await.unwrap();
        let source = transport.entries("ledger.source")[0]
            .field("data")
            .map(str::to_string)
            .unwrap();
        let mut envelope: Value = serde_json::from_str(&source).unwrap();
        envelope["payload"]["amount"] = json!("10000");
        let forged = envelope.to_string();
        transport
            .append("ledger.tamper", None, &[("data", forged.as_str())])
            .await
            .unwrap();

        let dead = dead_letter_stream("ledger.tamper");
        eventually("tampered entry to be rejected", || transport.entries(&dead).len() == 1).await;
        assert_eq!(transport.entries(&dead)[0].field("error"), Some("INVALID_SIGNATURE"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_mismatched_payload_is_parse_error() {
        let (bus, transport) = start_bus(fast_config(KEY)).await;
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        bus.consume_event::<OrderRequest, _>("matching", "engine-1", move |_envelope: MessageEnvelope<OrderRequest>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), anyhow::Error>(()) }
        })
        .await
        .unwrap();

        // Signed correctly, but not an order.
        bus.publish(streams::ORDER_REQUEST, &json!({"unexpected": true}))
            .await
            .unwrap();

        let dead = dead_letter_stream(streams::ORDER_REQUEST);
        eventually("undecodable payload to be rejected", || transport.entries(&dead).len() == 1).await;
        assert_eq!(transport.entries(&dead)[0].field("error"), Some("PARSE_ERROR"));
        drained(&transport, streams::ORDER_REQUEST, "matching").await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_newer_envelope_versions_are_processed() {
        let (bus, transport) = start_bus(fast_config(KEY)).await;
        let versions = Arc::new(parking_lot::Mutex::new(Vec::<u64>::new()));
        let sink = versions.clone();

        bus.consume::<Value, _>(
            fast_consumer("positions.v2", "risk", "c1"),
            move |envelope: MessageEnvelope<Value>| {
                sink.lock().push(envelope.v);
                std::future::ready(Ok::<(), anyhow::Error>(()))
            },
        )
        .await
        .unwrap();

        // Sealed by a producer speaking a newer envelope schema.
        let signer = Signer::new(KEY).unwrap();
        for v in [ENVELOPE_VERSION + 1, 70_000] {
            let mut envelope = MessageEnvelope::new("positions.v2", json!({"size": "-3"}), Some("future".into()));
            envelope.v = v;
            let data = serde_json::to_string(&signer.seal(envelope).unwrap()).unwrap();
            transport
                .append("positions.v2", None, &[("data", data.as_str())])
                .await
                .unwrap();
        }

        eventually("both versions to be handled", || versions.lock().len() == 2).await;
        drained(&transport, "positions.v2", "risk").await;
        assert_eq!(*versions.lock(), vec![ENVELOPE_VERSION + 1, 70_000]);
        assert!(transport.entries(&dead_letter_stream("positions.v2")).is_empty());
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_handler_exhausts_retries_once() {
        let mut config = fast_config(KEY);
        config.max_retries = 3;
        let (bus, transport) = start_bus(config).await;
        let calls = Arc::new(AtomicU32::new(0));

        bus.consume::<Value, _>(
            fast_consumer("settlement.run", "settler", "c1"),
            counting_handler(&calls, u32::MAX),
        )
        .await
        .unwrap();

        let original_id = bus
            .publish("settlement.run", &json!({"batch": 17}))
            .await
            .unwrap();

        let dead = dead_letter_stream("settlement.run");
        eventually("retries to be exhausted", || transport.entries(&dead).len() == 1).await;
        drained(&transport, "settlement.run", "settler").await;

        // No redelivery after the dead letter.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let entries = transport.entries(&dead);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].field("error"), Some("MAX_RETRIES"));
        assert_eq!(entries[0].field("retries"), Some("3"));
        assert_eq!(entries[0].field("originalId"), Some(original_id.as_str()));
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_without_dead_letter() {
        let (bus, transport) = start_bus(fast_config(KEY)).await;
        let calls = Arc::new(AtomicU32::new(0));

        bus.consume::<Value, _>(
            fast_consumer("funding.apply", "ledger", "c1"),
            counting_handler(&calls, 1),
        )
        .await
        .unwrap();

        bus.publish("funding.apply", &json!({"market": "BTC-PERP", "rate": "0.0001"}))
            .await
            .unwrap();

        eventually("retry to succeed", || calls.load(Ordering::SeqCst) == 2).await;
        drained(&transport, "funding.apply", "ledger").await;
        assert!(transport.entries(&dead_letter_stream("funding.apply")).is_empty());
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_payload_is_refused() {
        let mut config = fast_config(KEY);
        config.max_payload_bytes = 256;
        let (bus, transport) = start_bus(config).await;

        let err = bus
            .publish(streams::ORDER_REQUEST, &json!({"memo": "x".repeat(512)}))
            .await
            .unwrap_err();
        match err {
            BusError::PayloadTooLarge { stream, size, limit } => {
                assert_eq!(stream, streams::ORDER_REQUEST);
                assert_eq!(limit, 256);
                assert!(size > 512);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transport.length(streams::ORDER_REQUEST).await.unwrap(), 0);

        // A publish under the limit still goes through.
        bus.publish(streams::ORDER_REQUEST, &json!({"memo": "ok"}))
            .await
            .unwrap();
        assert_eq!(transport.length(streams::ORDER_REQUEST).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stream_limit_tighter_than_bus_limit() {
        let (bus, transport) = start_bus(fast_config(KEY)).await;

        let err = bus
            .publish(streams::PRICE_UPDATE, &json!({"blob": "p".repeat(8 * 1024)}))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::PayloadTooLarge { limit: 4096, .. }));
        assert_eq!(transport.length(streams::PRICE_UPDATE).await.unwrap(), 0);
    }
}
