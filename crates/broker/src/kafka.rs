//! Kafka-compatible broker built on rdkafka.
//!
//! Publishing goes through a shared `FutureProducer` keyed by order ID.
//! Each subscription owns a `StreamConsumer` with manual commits; a router
//! task fans its messages out to one [`PartitionConsumer`] per partition as
//! partitions are first seen, so the dispatcher can keep per-partition order
//! while processing partitions concurrently. The router never waits on a
//! slow partition: it pauses fetching for that partition instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::{mpsc, watch};

use crate::{
    BrokerError, PartitionBacklog, Result,
    broker::{Broker, Delivery, PartitionConsumer, PartitionStream, Record, RecordPosition},
};

/// Kafka broker client.
pub struct KafkaBroker {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    buffer_size: usize,
    auto_offset_reset: String,
    shutdown: watch::Sender<bool>,
}

impl KafkaBroker {
    /// Connects to a comma-separated list of brokers with default settings.
    pub fn new(brokers: &str) -> Result<Self> {
        Self::builder().brokers(brokers).build()
    }

    /// Creates a new builder.
    pub fn builder() -> KafkaBrokerBuilder {
        KafkaBrokerBuilder::default()
    }

    /// Returns the configured broker list.
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

/// Builder for [`KafkaBroker`].
#[derive(Debug, Default)]
pub struct KafkaBrokerBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    timeout: Option<Duration>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl KafkaBrokerBuilder {
    /// Sets the bootstrap servers (comma-separated).
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Sets the producer acknowledgment mode: "0", "1" or "all". Default: "all".
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Sets the producer send timeout. Default: 5 seconds.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets how many records may queue per partition consumer before fetching
    /// for that partition is paused. Default: 256.
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Sets where a group without committed offsets starts. Default: "earliest".
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Creates the producer and returns the broker client.
    pub fn build(self) -> Result<KafkaBroker> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::Connection("brokers not configured".to_string()))?;
        let acks = self.producer_acks.unwrap_or_else(|| "all".to_string());
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", &acks)
            .create()
            .map_err(|e| BrokerError::Connection(format!("failed to create producer: {e}")))?;

        let (shutdown, _) = watch::channel(false);
        tracing::info!(brokers = %brokers, acks = %acks, "kafka broker connected");

        Ok(KafkaBroker {
            producer,
            brokers,
            timeout,
            buffer_size: self.buffer_size.unwrap_or(256),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
            shutdown,
        })
    }
}

fn to_delivery(message: &BorrowedMessage<'_>) -> Delivery {
    Delivery {
        topic: message.topic().to_string(),
        partition: u32::try_from(message.partition()).unwrap_or_default(),
        offset: u64::try_from(message.offset()).unwrap_or_default(),
        key: message
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned()),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn publish(&self, topic: &str, record: Record) -> Result<RecordPosition> {
        let kafka_record = FutureRecord::to(topic)
            .key(&record.key)
            .payload(&record.payload);

        match self
            .producer
            .send(kafka_record, Timeout::After(self.timeout))
            .await
        {
            Ok((partition, offset)) => Ok(RecordPosition {
                topic: topic.to_string(),
                partition: u32::try_from(partition).unwrap_or_default(),
                offset: u64::try_from(offset).unwrap_or_default(),
            }),
            Err((error, _)) => Err(BrokerError::Publish {
                topic: topic.to_string(),
                reason: error.to_string(),
            }),
        }
    }

    async fn subscribe(&self, group: &str, topics: &[&str]) -> Result<PartitionStream> {
        let topic_names: Vec<String> = topics.iter().map(|t| (*t).to_string()).collect();
        let subscribe_error = |reason: String| BrokerError::Subscribe {
            topics: topic_names.clone(),
            reason,
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| subscribe_error(format!("failed to create consumer: {e}")))?;
        consumer
            .subscribe(topics)
            .map_err(|e| subscribe_error(format!("failed to subscribe: {e}")))?;

        tracing::info!(group, topics = ?topic_names, "kafka consumer subscribed");

        let consumer = Arc::new(consumer);
        let (assigned_tx, assigned_rx) = mpsc::channel::<Box<dyn PartitionConsumer>>(64);
        let mut shutdown = self.shutdown.subscribe();
        let buffer_size = self.buffer_size;
        let router = Arc::clone(&consumer);

        tokio::spawn(async move {
            let mut routes: HashMap<(String, u32), Route> = HashMap::new();
            let mut stream = router.stream();

            loop {
                let next = tokio::select! {
                    _ = shutdown.changed() => break,
                    next = stream.next() => next,
                };
                let delivery = match next {
                    None => break,
                    Some(Ok(message)) => to_delivery(&message),
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "kafka consumer error");
                        continue;
                    }
                };

                let key = (delivery.topic.clone(), delivery.partition);
                let route = match routes.get(&key) {
                    Some(route) if !route.deliveries.is_closed() => route.clone(),
                    _ => {
                        let (tx, rx) = mpsc::unbounded_channel();
                        let route = Route {
                            deliveries: tx,
                            backlog: Arc::new(PartitionBacklog::new(buffer_size)),
                        };
                        let partition_consumer = KafkaPartitionConsumer {
                            consumer: Arc::clone(&router),
                            topic: key.0.clone(),
                            partition: key.1,
                            deliveries: rx,
                            backlog: Arc::clone(&route.backlog),
                            replay: None,
                        };
                        if assigned_tx.send(Box::new(partition_consumer)).await.is_err() {
                            break;
                        }
                        routes.insert(key.clone(), route.clone());
                        route
                    }
                };

                route
                    .backlog
                    .pushed(|| set_paused(&router, &key.0, key.1, true));
                if route.deliveries.send(delivery).is_err() {
                    routes.remove(&key);
                }
            }

            tracing::debug!("kafka partition router exiting");
        });

        let stream = futures_util::stream::unfold(assigned_rx, |mut rx| async move {
            rx.recv().await.map(|consumer| (consumer, rx))
        });
        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.send_replace(true);
        let producer = self.producer.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| BrokerError::Connection(format!("flush task failed: {e}")))?
            .map_err(|e| BrokerError::Connection(format!("flush failed: {e}")))?;
        tracing::info!(brokers = %self.brokers, "kafka broker closed");
        Ok(())
    }
}

#[derive(Clone)]
struct Route {
    deliveries: mpsc::UnboundedSender<Delivery>,
    backlog: Arc<PartitionBacklog>,
}

fn set_paused(consumer: &StreamConsumer, topic: &str, partition: u32, paused: bool) {
    let mut partitions = TopicPartitionList::new();
    partitions.add_partition(topic, i32::try_from(partition).unwrap_or(i32::MAX));
    let result = if paused {
        consumer.pause(&partitions)
    } else {
        consumer.resume(&partitions)
    };
    match result {
        Ok(()) => tracing::debug!(topic, partition, paused, "partition fetch toggled"),
        Err(e) => tracing::warn!(topic, partition, paused, error = %e, "failed to toggle partition fetch"),
    }
}

struct KafkaPartitionConsumer {
    consumer: Arc<StreamConsumer>,
    topic: String,
    partition: u32,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    backlog: Arc<PartitionBacklog>,
    replay: Option<Delivery>,
}

#[async_trait]
impl PartitionConsumer for KafkaPartitionConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> u32 {
        self.partition
    }

    async fn next_delivery(&mut self) -> Option<Delivery> {
        if let Some(delivery) = self.replay.take() {
            return Some(delivery);
        }
        let delivery = self.deliveries.recv().await?;
        self.backlog
            .popped(|| set_paused(&self.consumer, &self.topic, self.partition, false));
        Some(delivery)
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<()> {
        let commit_error = |reason: String| BrokerError::Commit {
            topic: delivery.topic.clone(),
            partition: delivery.partition,
            offset: delivery.offset,
            reason,
        };
        let partition = i32::try_from(delivery.partition).map_err(|e| commit_error(e.to_string()))?;
        let next = i64::try_from(delivery.offset + 1).map_err(|e| commit_error(e.to_string()))?;

        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&delivery.topic, partition, Offset::Offset(next))
            .map_err(|e| commit_error(e.to_string()))?;
        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| commit_error(e.to_string()))
    }

    async fn redeliver(&mut self, delivery: &Delivery) -> Result<()> {
        self.replay = Some(delivery.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kafka_broker_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<KafkaBroker>();
    }

    #[test]
    fn builder_requires_brokers() {
        assert!(matches!(
            KafkaBroker::builder().build(),
            Err(BrokerError::Connection(_))
        ));
    }
}
