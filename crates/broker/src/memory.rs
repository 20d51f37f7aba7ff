use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, watch};

use crate::{
    BrokerError, Result,
    broker::{Broker, Delivery, PartitionConsumer, PartitionStream, Record, RecordPosition},
};

const DEFAULT_PARTITIONS: u32 = 3;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: String,
    payload: Vec<u8>,
}

type GroupPartition = (String, String, u32);

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    committed: HashMap<GroupPartition, u64>,
    publish_failures: VecDeque<String>,
    closed: bool,
}

impl BrokerState {
    fn topic_mut(&mut self, topic: &str, partitions: u32) -> &mut Vec<Vec<StoredRecord>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions as usize])
    }
}

struct Shared {
    state: RwLock<BrokerState>,
    partitions: u32,
    changes: watch::Sender<u64>,
}

/// In-memory partitioned log broker.
///
/// Topics are created on first use with a fixed number of partitions. A
/// record's partition is a stable hash of its key, so records sharing a key
/// are read back in publish order. Committed offsets are tracked per consumer
/// group, and a new subscription resumes from them, which gives the same
/// at-least-once behavior as a real broker across restarts of a dispatcher.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Creates a broker with three partitions per topic.
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    /// Creates a broker with the given number of partitions per topic (at least one).
    pub fn with_partitions(partitions: u32) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(BrokerState::default()),
                partitions: partitions.max(1),
                changes,
            }),
        }
    }

    /// Returns the partition a key is routed to.
    pub fn partition_for(&self, key: &str) -> u32 {
        partition_for(key, self.shared.partitions)
    }

    /// Returns every record of a topic, ordered by partition then offset.
    pub async fn records(&self, topic: &str) -> Vec<Delivery> {
        let state = self.shared.state.read().await;
        let Some(partitions) = state.topics.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, log)| {
                log.iter().enumerate().map(move |(offset, record)| Delivery {
                    topic: topic.to_string(),
                    partition: partition as u32,
                    offset: offset as u64,
                    key: Some(record.key.clone()),
                    payload: record.payload.clone(),
                })
            })
            .collect()
    }

    /// Returns the number of records in a topic.
    pub async fn record_count(&self, topic: &str) -> usize {
        let state = self.shared.state.read().await;
        state
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Returns the next offset a group will read from a partition, if it committed any.
    pub async fn committed_offset(&self, group: &str, topic: &str, partition: u32) -> Option<u64> {
        let state = self.shared.state.read().await;
        state
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Makes the next publish fail with the given error text.
    ///
    /// Calls queue up: each failure is consumed by exactly one publish.
    pub async fn fail_next_publish(&self, reason: impl Into<String>) {
        let mut state = self.shared.state.write().await;
        state.publish_failures.push_back(reason.into());
    }

    /// Returns true once [`close`](Broker::close) has been called.
    pub async fn is_closed(&self) -> bool {
        self.shared.state.read().await.closed
    }

    fn notify(&self) {
        self.shared.changes.send_modify(|version| *version += 1);
    }
}

fn partition_for(key: &str, partitions: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % u64::from(partitions)) as u32
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, topic: &str, record: Record) -> Result<RecordPosition> {
        let position = {
            let mut state = self.shared.state.write().await;
            if state.closed {
                return Err(BrokerError::Closed);
            }
            if let Some(reason) = state.publish_failures.pop_front() {
                return Err(BrokerError::Publish {
                    topic: topic.to_string(),
                    reason,
                });
            }

            let partition = partition_for(&record.key, self.shared.partitions);
            let log = &mut state.topic_mut(topic, self.shared.partitions)[partition as usize];
            let offset = log.len() as u64;
            log.push(StoredRecord {
                key: record.key,
                payload: record.payload,
            });

            RecordPosition {
                topic: topic.to_string(),
                partition,
                offset,
            }
        };

        self.notify();
        tracing::trace!(%position, "record appended");
        Ok(position)
    }

    async fn subscribe(&self, group: &str, topics: &[&str]) -> Result<PartitionStream> {
        if topics.is_empty() {
            return Err(BrokerError::Subscribe {
                topics: Vec::new(),
                reason: "no topics requested".to_string(),
            });
        }

        let mut state = self.shared.state.write().await;
        if state.closed {
            return Err(BrokerError::Closed);
        }

        let mut consumers: Vec<Box<dyn PartitionConsumer>> = Vec::new();
        for topic in topics {
            state.topic_mut(topic, self.shared.partitions);
            for partition in 0..self.shared.partitions {
                let position = state
                    .committed
                    .get(&(group.to_string(), topic.to_string(), partition))
                    .copied()
                    .unwrap_or(0);
                consumers.push(Box::new(InMemoryPartitionConsumer {
                    shared: Arc::clone(&self.shared),
                    group: group.to_string(),
                    topic: topic.to_string(),
                    partition,
                    position,
                    changes: self.shared.changes.subscribe(),
                }));
            }
        }

        tracing::debug!(group, ?topics, partitions = consumers.len(), "subscribed");
        Ok(Box::pin(futures_util::stream::iter(consumers)))
    }

    async fn close(&self) -> Result<()> {
        self.shared.state.write().await.closed = true;
        self.notify();
        Ok(())
    }
}

struct InMemoryPartitionConsumer {
    shared: Arc<Shared>,
    group: String,
    topic: String,
    partition: u32,
    position: u64,
    changes: watch::Receiver<u64>,
}

impl InMemoryPartitionConsumer {
    fn owns(&self, delivery: &Delivery) -> bool {
        delivery.topic == self.topic && delivery.partition == self.partition
    }

    fn foreign(&self, delivery: &Delivery) -> BrokerError {
        BrokerError::Commit {
            topic: delivery.topic.clone(),
            partition: delivery.partition,
            offset: delivery.offset,
            reason: format!(
                "delivery does not belong to consumer of {}/{}",
                self.topic, self.partition
            ),
        }
    }
}

#[async_trait]
impl PartitionConsumer for InMemoryPartitionConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> u32 {
        self.partition
    }

    async fn next_delivery(&mut self) -> Option<Delivery> {
        loop {
            // Mark the current version as seen before looking at the log, so
            // a publish racing with this check still wakes us up below.
            self.changes.borrow_and_update();
            {
                let state = self.shared.state.read().await;
                if state.closed {
                    return None;
                }
                let record = state
                    .topics
                    .get(&self.topic)
                    .and_then(|partitions| partitions.get(self.partition as usize))
                    .and_then(|log| log.get(self.position as usize));
                if let Some(record) = record {
                    let delivery = Delivery {
                        topic: self.topic.clone(),
                        partition: self.partition,
                        offset: self.position,
                        key: Some(record.key.clone()),
                        payload: record.payload.clone(),
                    };
                    self.position += 1;
                    return Some(delivery);
                }
            }
            if self.changes.changed().await.is_err() {
                return None;
            }
        }
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<()> {
        if !self.owns(delivery) {
            return Err(self.foreign(delivery));
        }
        let mut state = self.shared.state.write().await;
        let next = delivery.offset + 1;
        let committed = state
            .committed
            .entry((self.group.clone(), self.topic.clone(), self.partition))
            .or_insert(0);
        if next > *committed {
            *committed = next;
        }
        Ok(())
    }

    async fn redeliver(&mut self, delivery: &Delivery) -> Result<()> {
        if !self.owns(delivery) {
            return Err(self.foreign(delivery));
        }
        if delivery.offset < self.position {
            self.position = delivery.offset;
        }
        Ok(())
    }
}
