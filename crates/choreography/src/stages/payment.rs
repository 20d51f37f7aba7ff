//! Payment stage: authorizes each order once and emits the outcome.

use std::sync::Arc;

use async_trait::async_trait;
use broker::{EventEnvelope, EventType, OrderId};
use domain::{EventPayload, OrderCreated, PaymentResolved};

use crate::dispatcher::{ConsumerDispatcher, EventHandler};
use crate::error::Result;
use crate::idempotency::{Claim, IdempotencyKey, IdempotencyStore};
use crate::publisher::Publisher;
use crate::services::PaymentAuthorizer;
use crate::topics;

const SCOPE: &str = "payment";

/// Consumes `order_created` and emits `payment-succeeded` with the outcome.
///
/// The first recorded outcome for an order is final: redeliveries replay
/// it without calling the authorizer again.
pub struct PaymentStage {
    authorizer: Arc<dyn PaymentAuthorizer>,
    store: Arc<dyn IdempotencyStore>,
    publisher: Publisher,
}

impl PaymentStage {
    /// Creates a payment stage with its private idempotency store.
    pub fn new(
        authorizer: Arc<dyn PaymentAuthorizer>,
        store: Arc<dyn IdempotencyStore>,
        publisher: Publisher,
    ) -> Self {
        Self {
            authorizer,
            store,
            publisher,
        }
    }

    /// Returns the key under which an order's outcome is recorded.
    pub fn idempotency_key(order_id: &OrderId) -> IdempotencyKey {
        IdempotencyKey::new(SCOPE, order_id.as_str())
    }

    /// Binds this stage's subscriptions on a dispatcher.
    pub fn bind(self: Arc<Self>, dispatcher: ConsumerDispatcher) -> ConsumerDispatcher {
        dispatcher.bind(topics::ORDER_CREATED, EventType::OrderCreated, self)
    }

    /// Authorizes the order (or replays the recorded outcome) and emits it.
    ///
    /// Errors before the outcome is recorded fail the dispatch. Once the
    /// outcome is recorded this returns `Ok` even if the emit fails, so the
    /// customer is never charged twice.
    #[tracing::instrument(skip(self, envelope), fields(order_id = %envelope.order_id()))]
    pub async fn on_order_created(&self, envelope: &EventEnvelope) -> Result<PaymentResolved> {
        let order = OrderCreated::from_envelope(envelope)?;
        let key = Self::idempotency_key(&order.order_id);

        let (resolved, replayed) = match self.store.get(&key).await? {
            Some(recorded) => (serde_json::from_value::<PaymentResolved>(recorded)?, true),
            None => {
                let status = self.authorizer.authorize(&order).await?;
                let resolved = PaymentResolved::for_order(&order, status);
                match self
                    .store
                    .record_if_absent(&key, serde_json::to_value(&resolved)?)
                    .await?
                {
                    Claim::Inserted => (resolved, false),
                    Claim::Existing(recorded) => (serde_json::from_value(recorded)?, true),
                }
            }
        };

        tracing::info!(
            status = %resolved.payment_status,
            amount = %resolved.amount,
            replayed,
            "payment resolved"
        );
        metrics::counter!(
            "payments_processed_total",
            "status" => resolved.payment_status.as_str(),
            "replayed" => if replayed { "true" } else { "false" }
        )
        .increment(1);

        // Fire-and-forget: the publisher logs and counts the outcome.
        match resolved.to_envelope() {
            Ok(outcome) => {
                self.publisher.emit(topics::PAYMENT_SUCCEEDED, outcome);
            }
            Err(error) => {
                tracing::error!(error = %error, "failed to build payment outcome envelope");
            }
        }

        Ok(resolved)
    }
}

#[async_trait]
impl EventHandler for PaymentStage {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<()> {
        match envelope.event_type() {
            EventType::OrderCreated => self.on_order_created(envelope).await.map(|_| ()),
            _ => Ok(()),
        }
    }
}
