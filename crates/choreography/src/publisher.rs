//! Fire-and-forget event emission with outcome classification.

use std::sync::Arc;

use broker::{Broker, BrokerError, EventEnvelope, Record, RecordPosition};
use chrono::Utc;
use tokio::sync::{oneshot, watch};

/// Error text fragments that mark a publish failure as self-healing.
///
/// The broker client retries these internally once leadership settles.
const TRANSIENT_MARKERS: &[&str] = &[
    "leadership election",
    "no leader",
    "no current leader",
    "leader not available",
    "leadernotavailable",
    "not leader for partition",
    "notleaderforpartition",
    "broker not available",
    "brokernotavailable",
    "temporarily unavailable",
];

/// Classified result of one publish attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The broker stored the record.
    Accepted(RecordPosition),

    /// The broker is electing a leader or briefly unreachable. Non-fatal.
    Transient { reason: String },

    /// The event was not stored and will not be retried by the publisher.
    Fatal { reason: String },
}

impl PublishOutcome {
    /// Classifies a broker error by its text.
    pub fn from_error(error: &BrokerError) -> Self {
        let reason = error.to_string();
        if is_transient(&reason) {
            PublishOutcome::Transient { reason }
        } else {
            PublishOutcome::Fatal { reason }
        }
    }

    /// Returns the outcome name used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishOutcome::Accepted(_) => "accepted",
            PublishOutcome::Transient { .. } => "transient",
            PublishOutcome::Fatal { .. } => "fatal",
        }
    }

    /// Returns where the record was stored, if it was accepted.
    pub fn position(&self) -> Option<&RecordPosition> {
        match self {
            PublishOutcome::Accepted(position) => Some(position),
            _ => None,
        }
    }

    /// Returns true for [`PublishOutcome::Fatal`].
    pub fn is_fatal(&self) -> bool {
        matches!(self, PublishOutcome::Fatal { .. })
    }
}

fn is_transient(reason: &str) -> bool {
    let reason = reason.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| reason.contains(marker))
}

/// Awaitable result of an [`emit`](Publisher::emit).
///
/// Dropping the handle does not cancel the send.
#[derive(Debug)]
pub struct PublishHandle {
    outcome: oneshot::Receiver<PublishOutcome>,
}

impl PublishHandle {
    /// Waits for the broker's answer.
    pub async fn outcome(self) -> PublishOutcome {
        self.outcome.await.unwrap_or_else(|_| PublishOutcome::Fatal {
            reason: "publish task aborted".to_string(),
        })
    }
}

/// Decrements the in-flight count when a send task ends, even on panic.
struct InFlightGuard(Arc<watch::Sender<usize>>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// Emits envelopes to the broker.
///
/// Every [`emit`](Self::emit) makes exactly one publish attempt on a spawned
/// task. The publisher never retries or deduplicates; the classified outcome
/// is logged and counted here, and handed to whoever awaits the handle.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    in_flight: Arc<watch::Sender<usize>>,
}

impl Publisher {
    /// Creates a publisher over a broker connection.
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            broker,
            in_flight: Arc::new(in_flight),
        }
    }

    /// Starts publishing an envelope and returns immediately.
    ///
    /// The envelope is re-stamped with the emit time. Must be called from
    /// within a tokio runtime.
    pub fn emit(&self, topic: &str, envelope: EventEnvelope) -> PublishHandle {
        let envelope = envelope.with_produced_at(Utc::now());
        let (tx, rx) = oneshot::channel();

        self.in_flight.send_modify(|count| *count += 1);
        let guard = InFlightGuard(Arc::clone(&self.in_flight));
        let broker = Arc::clone(&self.broker);
        let topic = topic.to_string();

        tokio::spawn(async move {
            let _guard = guard;
            let outcome = send(broker.as_ref(), &topic, &envelope).await;
            let _ = tx.send(outcome);
        });

        PublishHandle { outcome: rx }
    }

    /// Returns the number of sends that have not completed yet.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Waits until every in-flight send has completed.
    pub async fn flush(&self) {
        let mut in_flight = self.in_flight.subscribe();
        let _ = in_flight.wait_for(|count| *count == 0).await;
    }
}

async fn send(broker: &dyn Broker, topic: &str, envelope: &EventEnvelope) -> PublishOutcome {
    let order_id = envelope.order_id();
    let event_type = envelope.event_type();

    let outcome = match Record::from_envelope(envelope) {
        Ok(record) => match broker.publish(topic, record).await {
            Ok(position) => PublishOutcome::Accepted(position),
            Err(error) => PublishOutcome::from_error(&error),
        },
        Err(error) => PublishOutcome::Fatal {
            reason: format!("encoding failed: {error}"),
        },
    };

    match &outcome {
        PublishOutcome::Accepted(position) => {
            tracing::debug!(%order_id, %event_type, %position, "event published");
        }
        PublishOutcome::Transient { reason } => {
            tracing::warn!(
                topic,
                %order_id,
                %event_type,
                error = %reason,
                "transient publish failure, broker client will retry"
            );
        }
        PublishOutcome::Fatal { reason } => {
            tracing::error!(
                topic,
                %order_id,
                %event_type,
                payload = %envelope.payload(),
                error = %reason,
                "event was not published"
            );
        }
    }

    metrics::counter!(
        "publisher_emits_total",
        "topic" => topic.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);

    outcome
}

#[cfg(test)]
mod tests {
    use broker::{EventType, InMemoryBroker};
    use serde_json::json;

    use super::*;

    fn envelope(order_id: &str) -> EventEnvelope {
        EventEnvelope::builder()
            .event_type(EventType::OrderCreated)
            .order_id(order_id)
            .payload_raw(json!({"orderId": order_id}))
            .build()
            .unwrap()
    }

    #[test]
    fn classifies_leadership_errors_as_transient() {
        for reason in [
            "There is no leader for this topic-partition as we are in the middle of a leadership election",
            "Broker: Leader not available",
            "LeaderNotAvailable",
            "This server is not the leader for that topic-partition (NotLeaderForPartition)",
        ] {
            let error = BrokerError::Publish {
                topic: "t".into(),
                reason: reason.into(),
            };
            assert!(
                matches!(PublishOutcome::from_error(&error), PublishOutcome::Transient { .. }),
                "{reason}"
            );
        }
    }

    #[test]
    fn classifies_other_errors_as_fatal() {
        let error = BrokerError::Publish {
            topic: "t".into(),
            reason: "Message size too large".into(),
        };
        assert!(PublishOutcome::from_error(&error).is_fatal());
        assert!(PublishOutcome::from_error(&BrokerError::Closed).is_fatal());
    }

    #[tokio::test]
    async fn accepted_outcome_carries_position() {
        let broker = InMemoryBroker::new();
        let publisher = Publisher::new(Arc::new(broker.clone()));

        let outcome = publisher.emit("order_created", envelope("O1")).outcome().await;

        let position = outcome.position().unwrap();
        assert_eq!(position.topic, "order_created");
        assert_eq!(position.partition, broker.partition_for("O1"));
        assert_eq!(broker.record_count("order_created").await, 1);
    }

    #[tokio::test]
    async fn emit_restamps_produced_at() {
        let broker = InMemoryBroker::new();
        let publisher = Publisher::new(Arc::new(broker.clone()));
        let stale = envelope("O1").with_produced_at(chrono::DateTime::UNIX_EPOCH);

        publisher.emit("order_created", stale).outcome().await;

        let stored = broker.records("order_created").await;
        let decoded = EventEnvelope::decode(&stored[0].payload).unwrap();
        assert!(decoded.produced_at() > chrono::DateTime::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn injected_failures_are_classified() {
        let broker = InMemoryBroker::new();
        let publisher = Publisher::new(Arc::new(broker.clone()));

        broker.fail_next_publish("leadership election in progress").await;
        let outcome = publisher.emit("order_created", envelope("O1")).outcome().await;
        assert!(matches!(outcome, PublishOutcome::Transient { .. }));

        broker.fail_next_publish("record rejected").await;
        let outcome = publisher.emit("order_created", envelope("O1")).outcome().await;
        assert!(outcome.is_fatal());

        assert_eq!(broker.record_count("order_created").await, 0);
    }

    #[tokio::test]
    async fn flush_waits_for_dropped_handles() {
        let broker = InMemoryBroker::new();
        let publisher = Publisher::new(Arc::new(broker.clone()));

        for i in 0..20 {
            drop(publisher.emit("order_created", envelope(&format!("O{i}"))));
        }
        publisher.flush().await;

        assert_eq!(publisher.in_flight(), 0);
        assert_eq!(broker.record_count("order_created").await, 20);
    }
}
