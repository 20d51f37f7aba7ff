//! Saga instance state, reconstructed from the event trail.
//!
//! Nothing here is persisted. A [`SagaTrail`] folds the envelopes of one
//! order into its current state; a [`SagaTracker`] keeps one trail per order
//! seen by a consumer group, up to a fixed number of orders.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use broker::{EventEnvelope, EventType, OrderId};
use domain::{EventPayload, NotificationOutcome, PaymentResolved, PaymentStatus};
use serde::{Serialize, Serializer};
use tokio::sync::RwLock;

use crate::dispatcher::{ConsumerDispatcher, EventHandler};
use crate::error::Result;
use crate::topics;

/// Where a saga instance is in its lifecycle.
///
/// ```text
/// Created ──► PaymentPending ──► PaymentResolved(SUCCESS|FAILED) ──┬──► Notified
///                                                                  └──► NotificationSkipped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SagaState {
    /// The order was accepted.
    Created,

    /// A payment was requested but not yet resolved.
    PaymentPending,

    /// The authorizer decided.
    PaymentResolved(PaymentStatus),

    /// The customer was told about the payment outcome (terminal state).
    Notified,

    /// There was nobody to tell about the payment outcome (terminal state).
    NotificationSkipped,
}

impl SagaState {
    /// Position in the lifecycle. States never move to a lower rank.
    pub fn rank(&self) -> u8 {
        match self {
            SagaState::Created => 0,
            SagaState::PaymentPending => 1,
            SagaState::PaymentResolved(_) => 2,
            SagaState::Notified | SagaState::NotificationSkipped => 3,
        }
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaState::Notified | SagaState::NotificationSkipped)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Created => "Created",
            SagaState::PaymentPending => "PaymentPending",
            SagaState::PaymentResolved(_) => "PaymentResolved",
            SagaState::Notified => "Notified",
            SagaState::NotificationSkipped => "NotificationSkipped",
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SagaState::PaymentResolved(status) => write!(f, "PaymentResolved({status})"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

impl Serialize for SagaState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// The folded event trail of one order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaTrail {
    order_id: OrderId,
    state: Option<SagaState>,
    payment_status: Option<PaymentStatus>,
    events_applied: u64,
}

impl SagaTrail {
    /// Creates an empty trail for an order.
    pub fn new(order_id: OrderId) -> Self {
        Self {
            order_id,
            state: None,
            payment_status: None,
            events_applied: 0,
        }
    }

    /// Folds a sequence of envelopes, in any order.
    pub fn from_events<'a>(
        order_id: OrderId,
        events: impl IntoIterator<Item = &'a EventEnvelope>,
    ) -> Self {
        let mut trail = Self::new(order_id);
        for envelope in events {
            trail.apply(envelope);
        }
        trail
    }

    /// Applies one envelope. Returns true if the state advanced.
    ///
    /// Envelopes for other orders, undecodable payloads and notification
    /// outcomes triggered by `order_created` leave the trail untouched.
    pub fn apply(&mut self, envelope: &EventEnvelope) -> bool {
        if envelope.order_id() != &self.order_id {
            return false;
        }

        let next = match envelope.event_type() {
            EventType::OrderCreated => SagaState::Created,
            EventType::ProcessPayment => SagaState::PaymentPending,
            EventType::PaymentResolved => match PaymentResolved::from_envelope(envelope) {
                Ok(payment) => {
                    self.payment_status = Some(payment.payment_status);
                    SagaState::PaymentResolved(payment.payment_status)
                }
                Err(_) => return false,
            },
            EventType::NotificationSent | EventType::NotificationSkipped => {
                match NotificationOutcome::from_envelope(envelope) {
                    Ok(outcome) if outcome.trigger == EventType::PaymentResolved => {
                        if envelope.event_type() == EventType::NotificationSent {
                            SagaState::Notified
                        } else {
                            SagaState::NotificationSkipped
                        }
                    }
                    _ => return false,
                }
            }
        };
        self.events_applied += 1;

        match self.state {
            Some(current) if current.rank() >= next.rank() => false,
            _ => {
                self.state = Some(next);
                true
            }
        }
    }

    pub fn order_id(&self) -> &OrderId {
        &self.order_id
    }

    /// Current state, or `None` before any event for this order.
    pub fn state(&self) -> Option<SagaState> {
        self.state
    }

    /// The payment outcome, once seen, even if the saga has moved past it.
    pub fn payment_status(&self) -> Option<PaymentStatus> {
        self.payment_status
    }

    /// Number of envelopes that contributed to this trail.
    pub fn events_applied(&self) -> u64 {
        self.events_applied
    }
}

/// Number of orders a [`SagaTracker`] remembers by default.
pub const DEFAULT_TRACKED_ORDERS: usize = 10_000;

#[derive(Debug, Default)]
struct Trails {
    by_order: HashMap<OrderId, SagaTrail>,
    // First-seen order, oldest first.
    arrival: VecDeque<OrderId>,
}

impl Trails {
    /// Makes room for one more order: the oldest finished saga goes first,
    /// otherwise the oldest saga.
    fn evict_one(&mut self) -> Option<OrderId> {
        let position = self
            .arrival
            .iter()
            .position(|id| {
                self.by_order
                    .get(id)
                    .and_then(SagaTrail::state)
                    .is_some_and(|state| state.is_terminal())
            })
            .unwrap_or(0);
        let evicted = self.arrival.remove(position)?;
        self.by_order.remove(&evicted);
        Some(evicted)
    }
}

/// Keeps a [`SagaTrail`] per order from the events a consumer group receives.
///
/// At most `capacity` orders are held; older ones are forgotten.
#[derive(Debug, Clone)]
pub struct SagaTracker {
    trails: Arc<RwLock<Trails>>,
    capacity: usize,
}

impl Default for SagaTracker {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TRACKED_ORDERS)
    }
}

impl SagaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tracker remembering at most `capacity` orders.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            trails: Arc::default(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the trail for an order, if any of its events were seen.
    pub async fn trail(&self, order_id: &OrderId) -> Option<SagaTrail> {
        self.trails.read().await.by_order.get(order_id).cloned()
    }

    /// Number of orders tracked.
    pub async fn len(&self) -> usize {
        self.trails.read().await.by_order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.trails.read().await.by_order.is_empty()
    }

    /// Binds every saga topic on a dispatcher.
    pub fn bind(self: Arc<Self>, dispatcher: ConsumerDispatcher) -> ConsumerDispatcher {
        dispatcher
            .bind(
                topics::ORDER_CREATED,
                EventType::OrderCreated,
                Arc::clone(&self) as Arc<dyn EventHandler>,
            )
            .bind(
                topics::PAYMENT_SUCCEEDED,
                EventType::PaymentResolved,
                Arc::clone(&self) as Arc<dyn EventHandler>,
            )
            .bind(
                topics::NOTIFICATION_OUTCOMES,
                EventType::NotificationSent,
                Arc::clone(&self) as Arc<dyn EventHandler>,
            )
            .bind(
                topics::NOTIFICATION_OUTCOMES,
                EventType::NotificationSkipped,
                self,
            )
    }
}

#[async_trait]
impl EventHandler for SagaTracker {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<()> {
        let order_id = envelope.order_id();
        let mut guard = self.trails.write().await;
        let trails = &mut *guard;

        if !trails.by_order.contains_key(order_id) {
            while trails.by_order.len() >= self.capacity {
                let Some(evicted) = trails.evict_one() else {
                    break;
                };
                tracing::debug!(order_id = %evicted, "saga trail evicted");
                metrics::counter!("saga_trails_evicted_total").increment(1);
            }
            trails.arrival.push_back(order_id.clone());
        }
        let trail = trails
            .by_order
            .entry(order_id.clone())
            .or_insert_with(|| SagaTrail::new(order_id.clone()));

        if trail.apply(envelope)
            && let Some(state) = trail.state()
        {
            tracing::debug!(
                %order_id,
                state = %state,
                "saga advanced"
            );
            metrics::counter!("saga_transitions_total", "state" => state.as_str()).increment(1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use domain::{NewOrder, OrderCreated};

    use super::*;

    fn order(order_id: &str, contact: Option<&str>) -> OrderCreated {
        let mut command = NewOrder::new("Book", 20.0).with_order_id(order_id);
        if let Some(contact) = contact {
            command = command.with_contact(contact);
        }
        command.validate().unwrap()
    }

    fn payment(order: &OrderCreated, status: PaymentStatus) -> EventEnvelope {
        PaymentResolved::for_order(order, status).to_envelope().unwrap()
    }

    fn sent(order: &OrderCreated, trigger: EventType) -> EventEnvelope {
        NotificationOutcome::sent(order.order_id.clone(), trigger, order.contact().unwrap().clone())
            .to_envelope()
            .unwrap()
    }

    fn skipped(order: &OrderCreated, trigger: EventType) -> EventEnvelope {
        NotificationOutcome::skipped(order.order_id.clone(), trigger, NotificationOutcome::NO_CONTACT)
            .to_envelope()
            .unwrap()
    }

    #[test]
    fn happy_path_ends_notified() {
        let o1 = order("O1", Some("a@b.com"));
        let events = [
            o1.to_envelope().unwrap(),
            sent(&o1, EventType::OrderCreated),
            payment(&o1, PaymentStatus::Success),
            sent(&o1, EventType::PaymentResolved),
        ];

        let trail = SagaTrail::from_events(OrderId::new("O1"), &events);

        assert_eq!(trail.state(), Some(SagaState::Notified));
        assert_eq!(trail.payment_status(), Some(PaymentStatus::Success));
        assert_eq!(trail.events_applied(), 3);
        assert!(trail.state().unwrap().is_terminal());
    }

    #[test]
    fn no_contact_ends_notification_skipped() {
        let o2 = order("O2", None);
        let events = [
            o2.to_envelope().unwrap(),
            skipped(&o2, EventType::OrderCreated),
            payment(&o2, PaymentStatus::Failed),
            skipped(&o2, EventType::PaymentResolved),
        ];

        let trail = SagaTrail::from_events(OrderId::new("O2"), &events);

        assert_eq!(trail.state(), Some(SagaState::NotificationSkipped));
        assert_eq!(trail.payment_status(), Some(PaymentStatus::Failed));
    }

    #[test]
    fn order_notification_does_not_move_the_saga() {
        let o1 = order("O1", Some("a@b.com"));
        let mut trail = SagaTrail::new(OrderId::new("O1"));

        assert!(trail.apply(&o1.to_envelope().unwrap()));
        assert!(!trail.apply(&sent(&o1, EventType::OrderCreated)));
        assert_eq!(trail.state(), Some(SagaState::Created));
    }

    #[test]
    fn state_never_regresses() {
        let o1 = order("O1", Some("a@b.com"));
        let mut trail = SagaTrail::new(OrderId::new("O1"));

        assert!(trail.apply(&payment(&o1, PaymentStatus::Success)));
        assert!(!trail.apply(&o1.to_envelope().unwrap()));
        assert_eq!(
            trail.state(),
            Some(SagaState::PaymentResolved(PaymentStatus::Success))
        );

        assert!(trail.apply(&sent(&o1, EventType::PaymentResolved)));
        assert!(!trail.apply(&payment(&o1, PaymentStatus::Success)));
        assert_eq!(trail.state(), Some(SagaState::Notified));
    }

    #[test]
    fn other_orders_are_ignored() {
        let other = order("O9", None);
        let mut trail = SagaTrail::new(OrderId::new("O1"));

        assert!(!trail.apply(&other.to_envelope().unwrap()));
        assert_eq!(trail.state(), None);
        assert_eq!(trail.events_applied(), 0);
    }

    #[test]
    fn process_payment_marks_pending() {
        let envelope = EventEnvelope::builder()
            .event_type(EventType::ProcessPayment)
            .order_id("O1")
            .payload_raw(serde_json::json!({"orderId": "O1"}))
            .build()
            .unwrap();

        let trail = SagaTrail::from_events(OrderId::new("O1"), [&envelope]);

        assert_eq!(trail.state(), Some(SagaState::PaymentPending));
    }

    #[test]
    fn state_serializes_by_name() {
        let json = serde_json::to_value(SagaState::PaymentResolved(PaymentStatus::Failed)).unwrap();
        assert_eq!(json, "PaymentResolved");
        assert_eq!(
            SagaState::PaymentResolved(PaymentStatus::Failed).to_string(),
            "PaymentResolved(FAILED)"
        );
    }

    #[tokio::test]
    async fn tracker_keeps_one_trail_per_order() {
        let tracker = SagaTracker::new();
        let o1 = order("O1", Some("a@b.com"));
        let o2 = order("O2", None);

        tracker.handle(&o1.to_envelope().unwrap()).await.unwrap();
        tracker.handle(&o2.to_envelope().unwrap()).await.unwrap();
        tracker
            .handle(&payment(&o1, PaymentStatus::Success))
            .await
            .unwrap();

        assert_eq!(tracker.len().await, 2);
        let trail = tracker.trail(&OrderId::new("O1")).await.unwrap();
        assert_eq!(
            trail.state(),
            Some(SagaState::PaymentResolved(PaymentStatus::Success))
        );
        assert!(tracker.trail(&OrderId::new("missing")).await.is_none());
    }

    #[tokio::test]
    async fn tracker_forgets_finished_sagas_first_when_full() {
        let tracker = SagaTracker::with_capacity(2);
        let a = order("A", None);
        let b = order("B", None);

        tracker.handle(&a.to_envelope().unwrap()).await.unwrap();
        tracker
            .handle(&skipped(&a, EventType::PaymentResolved))
            .await
            .unwrap();
        tracker.handle(&b.to_envelope().unwrap()).await.unwrap();
        tracker
            .handle(&order("C", None).to_envelope().unwrap())
            .await
            .unwrap();

        assert_eq!(tracker.len().await, 2);
        assert!(tracker.trail(&OrderId::new("A")).await.is_none());
        assert!(tracker.trail(&OrderId::new("B")).await.is_some());

        tracker
            .handle(&order("D", None).to_envelope().unwrap())
            .await
            .unwrap();

        assert_eq!(tracker.len().await, 2);
        assert!(tracker.trail(&OrderId::new("B")).await.is_none());
        assert!(tracker.trail(&OrderId::new("C")).await.is_some());
        assert!(tracker.trail(&OrderId::new("D")).await.is_some());
    }

    #[tokio::test]
    async fn known_orders_never_trigger_eviction() {
        let tracker = SagaTracker::with_capacity(1);
        let a = order("A", Some("a@b.com"));

        tracker.handle(&a.to_envelope().unwrap()).await.unwrap();
        tracker
            .handle(&payment(&a, PaymentStatus::Success))
            .await
            .unwrap();

        let trail = tracker.trail(&OrderId::new("A")).await.unwrap();
        assert_eq!(
            trail.state(),
            Some(SagaState::PaymentResolved(PaymentStatus::Success))
        );
        assert_eq!(tracker.capacity(), 1);
    }
}
