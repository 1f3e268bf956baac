//! # Delivery Scenarios
//!
//! Happy-path flows: a published payload reaches exactly one consumer per
//! group, intact and signed, and count-trimmed streams stay bounded.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use shared_bus::{StreamConfig, StreamRegistry, StreamTransport};
    use shared_types::events::streams;
    use shared_types::{MessageEnvelope, OrderRequest, OrderType, PriceUpdate, Side, ENVELOPE_VERSION};

    use crate::integration::fixtures::{
        drained, eventually, fast_config, fast_consumer, start_bus, KEY,
    };

    #[tokio::test]
    async fn test_order_request_is_handled_once() {
        let (bus, transport) = start_bus(fast_config(KEY)).await;
        let stored = Arc::new(Mutex::new(Vec::<MessageEnvelope<Value>>::new()));
        let sink = stored.clone();

        bus.consume::<Value, _>(
            fast_consumer(streams::ORDER_REQUEST, "g1", "c1"),
            move |envelope: MessageEnvelope<Value>| {
                let sink = sink.clone();
                async move {
                    sink.lock().push(envelope);
                    Ok::<(), anyhow::Error>(())
                }
            },
        )
        .await
        .unwrap();

        bus.publish(streams::ORDER_REQUEST, &json!({"orderId": "o1", "size": "100"}))
            .await
            .unwrap();

        eventually("order to be stored", || stored.lock().len() == 1).await;
        drained(&transport, streams::ORDER_REQUEST, "g1").await;

        // Several pending-check intervals pass without a redelivery.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let stored = stored.lock();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].payload, json!({"orderId": "o1", "size": "100"}));
        assert_eq!(stored[0].v, ENVELOPE_VERSION);
        assert_eq!(stored[0].event_type, streams::ORDER_REQUEST);
        assert_eq!(stored[0].producer.as_deref(), Some("bus-tests"));

        // Unbounded stream keeps the entry.
        assert_eq!(transport.length(streams::ORDER_REQUEST).await.unwrap(), 1);
        drop(stored);
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_each_group_receives_every_entry() {
        let (bus, transport) = start_bus(fast_config(KEY)).await;
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));

        for group in ["risk", "ledger"] {
            let sink = seen.clone();
            let group_name = group.to_string();
            bus.consume::<Value, _>(
                fast_consumer(streams::ORDER_UPDATE, group, "c1"),
                move |_envelope: MessageEnvelope<Value>| {
                    let sink = sink.clone();
                    let group_name = group_name.clone();
                    async move {
                        sink.lock().push(group_name);
                        Ok::<(), anyhow::Error>(())
                    }
                },
            )
            .await
            .unwrap();
        }

        bus.publish(streams::ORDER_UPDATE, &json!({"orderId": "o7", "status": "filled"}))
            .await
            .unwrap();

        eventually("both groups to handle the update", || seen.lock().len() == 2).await;
        let mut groups = seen.lock().clone();
        groups.sort();
        assert_eq!(groups, vec!["ledger".to_string(), "risk".to_string()]);
        drained(&transport, streams::ORDER_UPDATE, "risk").await;
        drained(&transport, streams::ORDER_UPDATE, "ledger").await;
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_consumers_in_one_group_share_entries() {
        let (bus, transport) = start_bus(fast_config(KEY)).await;
        let handled = Arc::new(Mutex::new(Vec::<(String, u64)>::new()));

        for consumer in ["c1", "c2"] {
            let sink = handled.clone();
            let name = consumer.to_string();
            bus.consume::<Value, _>(
                fast_consumer("shared.work", "workers", consumer),
                move |envelope: MessageEnvelope<Value>| {
                    let sink = sink.clone();
                    let name = name.clone();
                    async move {
                        let seq = envelope.payload["seq"].as_u64().unwrap_or_default();
                        sink.lock().push((name, seq));
                        Ok::<(), anyhow::Error>(())
                    }
                },
            )
            .await
            .unwrap();
        }

        for seq in 0..10u64 {
            bus.publish("shared.work", &json!({ "seq": seq })).await.unwrap();
        }

        eventually("all work items to be handled", || handled.lock().len() >= 10).await;
        drained(&transport, "shared.work", "workers").await;

        let mut seqs: Vec<u64> = handled.lock().iter().map(|(_, seq)| *seq).collect();
        seqs.sort_unstable();
        seqs.dedup();
        assert_eq!(seqs, (0..10).collect::<Vec<_>>());
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_count_trimmed_stream_stays_bounded() {
        let registry = StreamRegistry::with_defaults()
            .with_stream(StreamConfig::new("ticks.small").with_approx_max_len(3));
        let (bus, transport) = start_bus(fast_config(KEY).with_streams(registry)).await;

        for seq in 0..5 {
            bus.publish("ticks.small", &json!({ "seq": seq })).await.unwrap();
        }

        let length = transport.length("ticks.small").await.unwrap();
        assert!(length <= 3, "length {length} exceeds the trim target");

        // The newest entries survive.
        let last: Value =
            serde_json::from_str(transport.entries("ticks.small").last().unwrap().field("data").unwrap())
                .unwrap();
        assert_eq!(last["payload"]["seq"], 4);
    }

    #[tokio::test]
    async fn test_typed_events_round_trip() {
        let (bus, transport) = start_bus(fast_config(KEY)).await;
        let received = Arc::new(Mutex::new(Vec::<MessageEnvelope<OrderRequest>>::new()));
        let sink = received.clone();

        bus.consume_event::<OrderRequest, _>(
            "matching",
            "engine-1",
            move |envelope: MessageEnvelope<OrderRequest>| {
                let sink = sink.clone();
                async move {
                    sink.lock().push(envelope);
                    Ok::<(), anyhow::Error>(())
                }
            },
        )
        .await
        .unwrap();

        let order = OrderRequest {
            order_id: "o-42".into(),
            account: "acct-1".into(),
            market: "BTC-PERP".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            size: "0.25".into(),
            price: Some("64000.5".into()),
            client_order_id: None,
        };
        bus.publish_event(&order).await.unwrap();

        eventually("typed order to arrive", || received.lock().len() == 1).await;
        let received = received.lock();
        assert_eq!(received[0].payload, order);
        assert_eq!(received[0].event_type, "order.request");
        drop(received);
        drained(&transport, streams::ORDER_REQUEST, "matching").await;
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_price_stream_uses_default_trimming() {
        let (bus, transport) = start_bus(fast_config(KEY)).await;
        let tick = PriceUpdate {
            market: "ETH-PERP".into(),
            price: "3120.75".into(),
            source: "oracle".into(),
            publish_time: 1_700_000_000_000,
        };
        for _ in 0..3 {
            bus.publish_event(&tick).await.unwrap();
        }
        assert_eq!(transport.length(streams::PRICE_UPDATE).await.unwrap(), 3);

        let data = transport.entries(streams::PRICE_UPDATE)[0]
            .field("data")
            .map(str::to_string)
            .unwrap();
        let value: Value = serde_json::from_str(&data).unwrap();
        assert_eq!(value["payload"]["price"], "3120.75");
        assert_eq!(value["payload"]["publishTime"], 1_700_000_000_000u64);
    }
}
