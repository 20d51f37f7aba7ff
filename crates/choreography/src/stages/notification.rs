//! Notification stage: tells the customer about new orders and payment outcomes.

use std::sync::Arc;

use async_trait::async_trait;
use broker::{EventEnvelope, EventType, OrderId};
use domain::{EventPayload, NotificationOutcome, OrderCreated, PaymentResolved};

use crate::dispatcher::{ConsumerDispatcher, EventHandler};
use crate::error::Result;
use crate::idempotency::{Claim, IdempotencyKey, IdempotencyStore};
use crate::publisher::Publisher;
use crate::services::{NotificationMessage, Notifier};
use crate::topics;

const SCOPE: &str = "notification";

/// Consumes `order_created` and `payment-succeeded`; emits a
/// `notification_sent` or `notification_skipped` record for each.
///
/// With an idempotency store, each `(order, trigger)` pair reaches the
/// notifier at most once per successful send. Without one, redeliveries may
/// send duplicate messages.
pub struct NotificationStage {
    notifier: Arc<dyn Notifier>,
    publisher: Publisher,
    store: Option<Arc<dyn IdempotencyStore>>,
}

impl NotificationStage {
    /// Creates a notification stage without deduplication.
    pub fn new(notifier: Arc<dyn Notifier>, publisher: Publisher) -> Self {
        Self {
            notifier,
            publisher,
            store: None,
        }
    }

    /// Enables deduplication through a private idempotency store.
    pub fn with_idempotency(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Returns the key claimed before notifying about `trigger` for an order.
    pub fn idempotency_key(order_id: &OrderId, trigger: EventType) -> IdempotencyKey {
        IdempotencyKey::new(SCOPE, format!("{order_id}:{trigger}"))
    }

    /// Binds this stage's subscriptions on a dispatcher.
    pub fn bind(self: Arc<Self>, dispatcher: ConsumerDispatcher) -> ConsumerDispatcher {
        dispatcher
            .bind(
                topics::ORDER_CREATED,
                EventType::OrderCreated,
                Arc::clone(&self) as Arc<dyn EventHandler>,
            )
            .bind(topics::PAYMENT_SUCCEEDED, EventType::PaymentResolved, self)
    }

    /// Sends an order confirmation, or records that there is nobody to send it to.
    #[tracing::instrument(skip(self, envelope), fields(order_id = %envelope.order_id()))]
    pub async fn on_order_created(&self, envelope: &EventEnvelope) -> Result<NotificationOutcome> {
        let order = OrderCreated::from_envelope(envelope)?;
        let message = order.contact().map(|recipient| NotificationMessage {
            recipient: recipient.clone(),
            subject: format!("Order Confirmation #{}", order.order_id),
            body: format!(
                "Your order {} for {} ({}) has been received.",
                order.order_id, order.product, order.price
            ),
        });
        self.notify(&order.order_id, EventType::OrderCreated, message)
            .await
    }

    /// Tells the customer whether the payment went through.
    #[tracing::instrument(skip(self, envelope), fields(order_id = %envelope.order_id()))]
    pub async fn on_payment_resolved(
        &self,
        envelope: &EventEnvelope,
    ) -> Result<NotificationOutcome> {
        let payment = PaymentResolved::from_envelope(envelope)?;
        let message = payment.contact().map(|recipient| NotificationMessage {
            recipient: recipient.clone(),
            subject: format!(
                "Payment {} - Order #{}",
                payment.payment_status, payment.order_id
            ),
            body: format!(
                "Payment {} for order {}: {}.",
                payment.payment_status, payment.order_id, payment.amount
            ),
        });
        self.notify(&payment.order_id, EventType::PaymentResolved, message)
            .await
    }

    async fn notify(
        &self,
        order_id: &OrderId,
        trigger: EventType,
        message: Option<NotificationMessage>,
    ) -> Result<NotificationOutcome> {
        let Some(message) = message else {
            tracing::info!(%trigger, "no contact, notification skipped");
            let outcome =
                NotificationOutcome::skipped(order_id.clone(), trigger, NotificationOutcome::NO_CONTACT);
            self.record(&outcome);
            return Ok(outcome);
        };

        let outcome = NotificationOutcome::sent(order_id.clone(), trigger, message.recipient.clone());
        let claim = match &self.store {
            Some(store) => {
                let key = Self::idempotency_key(order_id, trigger);
                match store
                    .record_if_absent(&key, serde_json::to_value(&outcome)?)
                    .await?
                {
                    Claim::Inserted => Some((store, key)),
                    Claim::Existing(recorded) => {
                        tracing::debug!(%trigger, "already notified, skipping duplicate");
                        return Ok(serde_json::from_value(recorded)?);
                    }
                }
            }
            None => None,
        };

        if let Err(error) = self.notifier.send(&message).await {
            if let Some((store, key)) = claim
                && let Err(release) = store.remove(&key).await
            {
                tracing::warn!(%key, error = %release, "failed to release notification claim");
            }
            return Err(error);
        }

        self.record(&outcome);
        Ok(outcome)
    }

    fn record(&self, outcome: &NotificationOutcome) {
        metrics::counter!(
            "notifications_total",
            "type" => outcome.trigger.as_str(),
            "status" => outcome.status.as_str()
        )
        .increment(1);

        match outcome.to_envelope() {
            Ok(envelope) => {
                self.publisher.emit(topics::NOTIFICATION_OUTCOMES, envelope);
            }
            Err(error) => {
                tracing::error!(error = %error, "failed to build notification outcome envelope");
            }
        }
    }
}

#[async_trait]
impl EventHandler for NotificationStage {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<()> {
        match envelope.event_type() {
            EventType::OrderCreated => self.on_order_created(envelope).await.map(|_| ()),
            EventType::PaymentResolved => self.on_payment_resolved(envelope).await.map(|_| ()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use broker::{Broker, InMemoryBroker, Record};
    use domain::{NewOrder, NotificationStatus, PaymentStatus};

    use super::*;
    use crate::dead_letter::InMemoryDeadLetterSink;
    use crate::dispatcher::DispatcherConfig;
    use crate::error::ChoreographyError;
    use crate::idempotency::InMemoryIdempotencyStore;
    use crate::retry::RedeliveryPolicy;
    use crate::services::InMemoryNotifier;

    struct Fixture {
        stage: NotificationStage,
        broker: InMemoryBroker,
        notifier: InMemoryNotifier,
        store: InMemoryIdempotencyStore,
        publisher: Publisher,
    }

    fn fixture(dedup: bool) -> Fixture {
        let broker = InMemoryBroker::new();
        let publisher = Publisher::new(Arc::new(broker.clone()));
        let notifier = InMemoryNotifier::new();
        let store = InMemoryIdempotencyStore::new();
        let mut stage = NotificationStage::new(Arc::new(notifier.clone()), publisher.clone());
        if dedup {
            stage = stage.with_idempotency(Arc::new(store.clone()));
        }
        Fixture {
            stage,
            broker,
            notifier,
            store,
            publisher,
        }
    }

    fn order(order_id: &str, contact: Option<&str>) -> OrderCreated {
        let mut command = NewOrder::new("Book", 20.0).with_order_id(order_id);
        if let Some(contact) = contact {
            command = command.with_contact(contact);
        }
        command.validate().unwrap()
    }

    fn payment(order_id: &str, contact: Option<&str>, status: PaymentStatus) -> EventEnvelope {
        PaymentResolved::for_order(&order(order_id, contact), status)
            .to_envelope()
            .unwrap()
    }

    async fn outcomes(f: &Fixture) -> Vec<NotificationOutcome> {
        f.publisher.flush().await;
        f.broker
            .records(topics::NOTIFICATION_OUTCOMES)
            .await
            .iter()
            .map(|d| {
                NotificationOutcome::from_envelope(&EventEnvelope::decode(&d.payload).unwrap())
                    .unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn order_confirmation_is_sent() {
        let f = fixture(true);

        let outcome = f
            .stage
            .on_order_created(&order("O1", Some("a@b.com")).to_envelope().unwrap())
            .await
            .unwrap();

        assert_eq!(outcome.status, NotificationStatus::Sent);
        assert_eq!(outcome.trigger, EventType::OrderCreated);
        let sent = f.notifier.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient.as_str(), "a@b.com");
        assert_eq!(sent[0].subject, "Order Confirmation #O1");
        assert!(sent[0].body.contains("Book"));
        assert!(sent[0].body.contains("$20.00"));

        let emitted = outcomes(&f).await;
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].event_type(), EventType::NotificationSent);
    }

    #[tokio::test]
    async fn payment_notification_names_the_status() {
        let f = fixture(true);

        f.stage
            .on_payment_resolved(&payment("O1", Some("a@b.com"), PaymentStatus::Failed))
            .await
            .unwrap();

        let sent = f.notifier.sent().await;
        assert_eq!(sent[0].subject, "Payment FAILED - Order #O1");
        assert!(sent[0].body.contains("FAILED"));
    }

    #[tokio::test]
    async fn missing_contact_is_skipped_without_calling_notifier() {
        let f = fixture(true);

        let on_order = f
            .stage
            .on_order_created(&order("O2", None).to_envelope().unwrap())
            .await
            .unwrap();
        let on_payment = f
            .stage
            .on_payment_resolved(&payment("O2", None, PaymentStatus::Success))
            .await
            .unwrap();

        for outcome in [&on_order, &on_payment] {
            assert_eq!(outcome.status, NotificationStatus::Skipped);
            assert_eq!(outcome.reason.as_deref(), Some("no contact"));
        }
        assert_eq!(f.notifier.sent_count().await, 0);

        let emitted = outcomes(&f).await;
        assert_eq!(emitted.len(), 2);
        assert!(
            emitted
                .iter()
                .all(|o| o.event_type() == EventType::NotificationSkipped)
        );
    }

    #[tokio::test]
    async fn duplicate_delivery_notifies_once_with_dedup() {
        let f = fixture(true);
        let envelope = order("O1", Some("a@b.com")).to_envelope().unwrap();

        let first = f.stage.on_order_created(&envelope).await.unwrap();
        let second = f.stage.on_order_created(&envelope).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(f.notifier.sent_count().await, 1);
        assert_eq!(outcomes(&f).await.len(), 1);
    }

    #[tokio::test]
    async fn same_order_different_triggers_are_distinct() {
        let f = fixture(true);

        f.stage
            .on_order_created(&order("O1", Some("a@b.com")).to_envelope().unwrap())
            .await
            .unwrap();
        f.stage
            .on_payment_resolved(&payment("O1", Some("a@b.com"), PaymentStatus::Success))
            .await
            .unwrap();

        assert_eq!(f.notifier.sent_count().await, 2);
        assert_eq!(f.store.len().await, 2);
    }

    #[tokio::test]
    async fn duplicate_delivery_notifies_twice_without_dedup() {
        let f = fixture(false);
        let envelope = order("O1", Some("a@b.com")).to_envelope().unwrap();

        f.stage.on_order_created(&envelope).await.unwrap();
        f.stage.on_order_created(&envelope).await.unwrap();

        assert_eq!(f.notifier.sent_count().await, 2);
    }

    #[tokio::test]
    async fn notifier_failure_releases_the_claim() {
        let f = fixture(true);
        f.notifier.fail_next(1).await;
        let envelope = order("O1", Some("a@b.com")).to_envelope().unwrap();

        let error = f.stage.on_order_created(&envelope).await.unwrap_err();
        assert!(matches!(error, ChoreographyError::Notification(_)));
        assert!(error.is_retryable());
        assert!(f.store.is_empty().await);

        f.stage.on_order_created(&envelope).await.unwrap();
        assert_eq!(f.notifier.sent_count().await, 1);
        assert_eq!(outcomes(&f).await.len(), 1);
    }

    #[test]
    fn idempotency_key_combines_order_and_trigger() {
        let key = NotificationStage::idempotency_key(&OrderId::new("O1"), EventType::PaymentResolved);
        assert_eq!(key.scope(), "notification");
        assert_eq!(key.key(), "O1:payment-succeeded");
    }

    #[tokio::test]
    async fn transient_publish_failure_still_commits_the_payment() {
        let Fixture {
            stage,
            broker,
            notifier,
            store,
            ..
        } = fixture(true);
        broker
            .publish(
                topics::PAYMENT_SUCCEEDED,
                Record::from_envelope(&payment("O1", Some("a@b.com"), PaymentStatus::Success))
                    .unwrap(),
            )
            .await
            .unwrap();
        broker.fail_next_publish("leadership election in progress").await;

        let sink = InMemoryDeadLetterSink::new();
        let dispatcher = Arc::new(stage).bind(
            ConsumerDispatcher::new(
                Arc::new(broker.clone()),
                DispatcherConfig::new("notifications")
                    .with_redelivery(RedeliveryPolicy::immediate()),
            )
            .with_dead_letter_sink(Arc::new(sink.clone())),
        );
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(dispatcher.run(async move {
            let _ = stop_rx.await;
        }));

        let partition = broker.partition_for("O1");
        let deadline = Instant::now() + Duration::from_secs(5);
        while broker
            .committed_offset("notifications", topics::PAYMENT_SUCCEEDED, partition)
            .await
            != Some(1)
        {
            assert!(Instant::now() < deadline, "payment outcome was not committed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let _ = stop_tx.send(());
        task.await.unwrap().unwrap();

        assert!(sink.is_empty().await);
        assert_eq!(notifier.sent().await.len(), 1);
        let recorded = store
            .get(&NotificationStage::idempotency_key(
                &OrderId::new("O1"),
                EventType::PaymentResolved,
            ))
            .await
            .unwrap();
        assert!(recorded.is_some());
    }
}
