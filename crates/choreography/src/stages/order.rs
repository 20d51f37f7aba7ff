//! Order stage: turns a new-order command into the first event of a saga.

use broker::{OrderId, RecordPosition};
use domain::{EventPayload, SubmitOrderRequest};
use serde::Serialize;

use crate::error::Result;
use crate::publisher::{PublishOutcome, Publisher};
use crate::topics;

/// Whether the order was handed to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Success,
    Error,
}

impl ReceiptStatus {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Success => "success",
            ReceiptStatus::Error => "error",
        }
    }
}

/// Acknowledgement returned to the caller of [`OrderStage::submit_order`].
///
/// Success means the event was handed to the broker, never that payment
/// or notification happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub status: ReceiptStatus,
    pub topic: String,
    pub order_id: OrderId,
    /// Where the broker stored the event; absent when the broker client is
    /// still retrying.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_response: Option<RecordPosition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubmitReceipt {
    /// Returns true if the event was handed to the broker.
    pub fn is_success(&self) -> bool {
        self.status == ReceiptStatus::Success
    }
}

/// Accepts new orders and emits `order_created`.
#[derive(Clone)]
pub struct OrderStage {
    publisher: Publisher,
}

impl OrderStage {
    /// Creates a new order stage.
    pub fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }

    /// Validates an order, assigns its ID if needed and publishes `order_created`.
    ///
    /// A validation failure is returned as an error and nothing is
    /// published. Broker failures are reported in the receipt.
    #[tracing::instrument(skip(self, request), fields(order_id))]
    pub async fn submit_order(&self, request: SubmitOrderRequest) -> Result<SubmitReceipt> {
        let order = request.validate()?;
        tracing::Span::current().record("order_id", order.order_id.as_str());

        let envelope = order.to_envelope()?;
        let outcome = self
            .publisher
            .emit(topics::ORDER_CREATED, envelope)
            .outcome()
            .await;

        let (status, broker_response, error) = match outcome {
            PublishOutcome::Accepted(position) => (ReceiptStatus::Success, Some(position), None),
            PublishOutcome::Transient { .. } => (ReceiptStatus::Success, None, None),
            PublishOutcome::Fatal { reason } => (ReceiptStatus::Error, None, Some(reason)),
        };
        tracing::info!(
            status = status.as_str(),
            product = %order.product,
            amount = %order.price,
            "order submitted"
        );
        metrics::counter!("orders_submitted_total", "status" => status.as_str()).increment(1);

        Ok(SubmitReceipt {
            status,
            topic: topics::ORDER_CREATED.to_string(),
            order_id: order.order_id,
            broker_response,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use broker::{EventEnvelope, EventType, InMemoryBroker};
    use domain::{NewOrder, OrderError};

    use super::*;
    use crate::error::ChoreographyError;

    fn stage() -> (OrderStage, InMemoryBroker) {
        let broker = InMemoryBroker::new();
        let stage = OrderStage::new(Publisher::new(Arc::new(broker.clone())));
        (stage, broker)
    }

    fn request(order: NewOrder) -> SubmitOrderRequest {
        SubmitOrderRequest::new(order)
    }

    #[tokio::test]
    async fn valid_order_emits_one_keyed_event() {
        let (stage, broker) = stage();

        let receipt = stage
            .submit_order(request(
                NewOrder::new("Book", 20.0)
                    .with_order_id("O1")
                    .with_contact("a@b.com"),
            ))
            .await
            .unwrap();

        assert!(receipt.is_success());
        assert_eq!(receipt.order_id.as_str(), "O1");
        assert_eq!(receipt.topic, "order_created");
        let position = receipt.broker_response.unwrap();
        assert_eq!(position.partition, broker.partition_for("O1"));

        let records = broker.records(topics::ORDER_CREATED).await;
        assert_eq!(records.len(), 1);
        let envelope = EventEnvelope::decode(&records[0].payload).unwrap();
        assert_eq!(envelope.event_type(), EventType::OrderCreated);
        assert_eq!(envelope.key(), "O1");
        assert_eq!(envelope.payload()["customerContact"], "a@b.com");
    }

    #[tokio::test]
    async fn missing_order_id_is_generated() {
        let (stage, broker) = stage();

        let receipt = stage
            .submit_order(request(NewOrder::new("Pen", 2.0)))
            .await
            .unwrap();

        assert!(!receipt.order_id.is_blank());
        let records = broker.records(topics::ORDER_CREATED).await;
        assert_eq!(records[0].key.as_deref(), Some(receipt.order_id.as_str()));
    }

    #[tokio::test]
    async fn invalid_order_publishes_nothing() {
        let (stage, broker) = stage();

        let result = stage.submit_order(request(NewOrder::new("Book", 0.0))).await;

        assert!(matches!(
            result,
            Err(ChoreographyError::Validation(OrderError::InvalidPrice { .. }))
        ));
        assert_eq!(broker.record_count(topics::ORDER_CREATED).await, 0);
    }

    #[tokio::test]
    async fn transient_failure_is_still_success() {
        let (stage, broker) = stage();
        broker.fail_next_publish("There is no leader for this topic-partition").await;

        let receipt = stage
            .submit_order(request(NewOrder::new("Book", 20.0)))
            .await
            .unwrap();

        assert!(receipt.is_success());
        assert!(receipt.broker_response.is_none());
    }

    #[tokio::test]
    async fn fatal_failure_is_reported_in_receipt() {
        let (stage, broker) = stage();
        broker.fail_next_publish("authorization failed").await;

        let receipt = stage
            .submit_order(request(NewOrder::new("Book", 20.0)))
            .await
            .unwrap();

        assert_eq!(receipt.status, ReceiptStatus::Error);
        assert!(receipt.error.unwrap().contains("authorization failed"));
    }

    #[test]
    fn receipt_wire_shape() {
        let receipt = SubmitReceipt {
            status: ReceiptStatus::Success,
            topic: "order_created".to_string(),
            order_id: OrderId::new("O1"),
            broker_response: Some(RecordPosition {
                topic: "order_created".to_string(),
                partition: 2,
                offset: 0,
            }),
            error: None,
        };
        let json = serde_json::to_value(&receipt).unwrap();

        assert_eq!(json["status"], "success");
        assert_eq!(json["orderId"], "O1");
        assert_eq!(json["brokerResponse"]["partition"], 2);
        assert!(json.get("error").is_none());
    }
}
