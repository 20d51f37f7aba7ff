//! Integration tests for the in-memory broker carrying event envelopes.

use broker::{Broker, EventEnvelope, EventType, InMemoryBroker, PartitionConsumer, Record};
use futures_util::StreamExt;
use serde_json::json;

fn envelope(order_id: &str, seq: u32) -> EventEnvelope {
    EventEnvelope::builder()
        .event_type(EventType::OrderCreated)
        .order_id(order_id)
        .payload_raw(json!({"orderId": order_id, "seq": seq}))
        .build()
        .unwrap()
}

async fn drain(consumer: &mut Box<dyn PartitionConsumer>, count: usize) -> Vec<EventEnvelope> {
    let mut envelopes = Vec::with_capacity(count);
    for _ in 0..count {
        let delivery = consumer.next_delivery().await.unwrap();
        envelopes.push(EventEnvelope::decode(&delivery.payload).unwrap());
        consumer.commit(&delivery).await.unwrap();
    }
    envelopes
}

#[tokio::test]
async fn envelopes_for_one_order_are_read_in_publish_order() {
    let broker = InMemoryBroker::new();
    for seq in 0..10 {
        for order in ["O1", "O2", "O3"] {
            let record = Record::from_envelope(&envelope(order, seq)).unwrap();
            broker.publish("order_created", record).await.unwrap();
        }
    }

    let mut consumers: Vec<_> = broker
        .subscribe("g", &["order_created"])
        .await
        .unwrap()
        .collect()
        .await;

    let mut seen: std::collections::HashMap<String, Vec<u64>> = Default::default();
    for consumer in &mut consumers {
        let partition = consumer.partition();
        let expected = broker
            .records("order_created")
            .await
            .into_iter()
            .filter(|d| d.partition == partition)
            .count();
        for envelope in drain(consumer, expected).await {
            seen.entry(envelope.order_id().to_string())
                .or_default()
                .push(envelope.payload()["seq"].as_u64().unwrap());
        }
    }

    for order in ["O1", "O2", "O3"] {
        assert_eq!(seen[order], (0..10).collect::<Vec<u64>>(), "order {order}");
    }
}

#[tokio::test]
async fn record_key_is_the_order_id() {
    let broker = InMemoryBroker::new();
    let record = Record::from_envelope(&envelope("O9", 0)).unwrap();
    let position = broker.publish("order_created", record).await.unwrap();

    assert_eq!(position.partition, broker.partition_for("O9"));
    let stored = broker.records("order_created").await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].key.as_deref(), Some("O9"));
}

#[tokio::test]
async fn uncommitted_records_are_redelivered_to_a_new_subscription() {
    let broker = InMemoryBroker::with_partitions(1);
    broker
        .publish("order_created", Record::from_envelope(&envelope("O1", 0)).unwrap())
        .await
        .unwrap();

    {
        let mut consumers: Vec<_> = broker
            .subscribe("g", &["order_created"])
            .await
            .unwrap()
            .collect()
            .await;
        let delivery = consumers[0].next_delivery().await.unwrap();
        assert_eq!(delivery.offset, 0);
        // dropped without commit
    }

    let mut consumers: Vec<_> = broker
        .subscribe("g", &["order_created"])
        .await
        .unwrap()
        .collect()
        .await;
    let again = consumers[0].next_delivery().await.unwrap();
    assert_eq!(again.offset, 0);
}
