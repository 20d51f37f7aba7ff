//! Payment authorizer trait, a random reference policy and an in-memory stand-in.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use broker::OrderId;
use domain::{OrderCreated, PaymentStatus};
use rand::Rng;
use tokio::sync::Mutex;

use crate::error::{ChoreographyError, Result};

/// Default probability that [`RandomAuthorizer`] approves a payment.
pub const DEFAULT_SUCCESS_PROBABILITY: f64 = 0.8;

/// Trait for payment authorization.
///
/// A declined payment is an outcome, not an error. Errors mean no decision
/// was reached and the order may be retried.
#[async_trait]
pub trait PaymentAuthorizer: Send + Sync {
    /// Decides whether the order's amount is charged.
    async fn authorize(&self, order: &OrderCreated) -> Result<PaymentStatus>;
}

/// Approves payments with a fixed probability. Demonstration only.
#[derive(Debug, Clone, Copy)]
pub struct RandomAuthorizer {
    success_probability: f64,
}

impl RandomAuthorizer {
    /// Creates an authorizer; the probability is clamped to `[0, 1]`.
    pub fn new(success_probability: f64) -> Self {
        let success_probability = if success_probability.is_nan() {
            0.0
        } else {
            success_probability.clamp(0.0, 1.0)
        };
        Self {
            success_probability,
        }
    }

    /// Returns the effective success probability.
    pub fn success_probability(&self) -> f64 {
        self.success_probability
    }
}

impl Default for RandomAuthorizer {
    fn default() -> Self {
        Self::new(DEFAULT_SUCCESS_PROBABILITY)
    }
}

#[async_trait]
impl PaymentAuthorizer for RandomAuthorizer {
    async fn authorize(&self, order: &OrderCreated) -> Result<PaymentStatus> {
        let approved = rand::thread_rng().gen_bool(self.success_probability);
        let status = if approved {
            PaymentStatus::Success
        } else {
            PaymentStatus::Failed
        };
        tracing::debug!(order_id = %order.order_id, amount = %order.price, %status, "payment drawn");
        Ok(status)
    }
}

#[derive(Debug, Default)]
struct InMemoryAuthorizerState {
    scripted: VecDeque<std::result::Result<PaymentStatus, String>>,
    charged: Vec<OrderId>,
}

/// Deterministic authorizer for tests.
///
/// Scripted outcomes are consumed in order; once they run out the default
/// status is returned. Every call that reaches a decision is counted.
#[derive(Debug, Clone)]
pub struct InMemoryAuthorizer {
    default_status: PaymentStatus,
    state: Arc<Mutex<InMemoryAuthorizerState>>,
}

impl InMemoryAuthorizer {
    /// Creates an authorizer that returns `default_status` unless scripted otherwise.
    pub fn new(default_status: PaymentStatus) -> Self {
        Self {
            default_status,
            state: Arc::default(),
        }
    }

    /// Creates an authorizer that approves every payment.
    pub fn approving() -> Self {
        Self::new(PaymentStatus::Success)
    }

    /// Creates an authorizer that declines every payment.
    pub fn declining() -> Self {
        Self::new(PaymentStatus::Failed)
    }

    /// Queues a status for the next call.
    pub async fn push_outcome(&self, status: PaymentStatus) {
        self.state.lock().await.scripted.push_back(Ok(status));
    }

    /// Makes the next call fail without deciding.
    pub async fn fail_next(&self, reason: impl Into<String>) {
        self.state.lock().await.scripted.push_back(Err(reason.into()));
    }

    /// Returns the number of decisions made.
    pub async fn charge_count(&self) -> usize {
        self.state.lock().await.charged.len()
    }

    /// Returns the orders a decision was made for, in call order.
    pub async fn charged_orders(&self) -> Vec<OrderId> {
        self.state.lock().await.charged.clone()
    }
}

#[async_trait]
impl PaymentAuthorizer for InMemoryAuthorizer {
    async fn authorize(&self, order: &OrderCreated) -> Result<PaymentStatus> {
        let mut state = self.state.lock().await;
        let status = match state.scripted.pop_front() {
            Some(Ok(status)) => status,
            Some(Err(reason)) => return Err(ChoreographyError::Authorization(reason)),
            None => self.default_status,
        };
        state.charged.push(order.order_id.clone());
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use domain::NewOrder;

    use super::*;

    fn order() -> OrderCreated {
        NewOrder::new("Book", 20.0)
            .with_order_id("O1")
            .validate()
            .unwrap()
    }

    #[tokio::test]
    async fn random_authorizer_extremes_are_deterministic() {
        let always = RandomAuthorizer::new(1.0);
        let never = RandomAuthorizer::new(0.0);

        for _ in 0..50 {
            assert_eq!(always.authorize(&order()).await.unwrap(), PaymentStatus::Success);
            assert_eq!(never.authorize(&order()).await.unwrap(), PaymentStatus::Failed);
        }
    }

    #[test]
    fn random_authorizer_clamps_probability() {
        assert_eq!(RandomAuthorizer::new(1.5).success_probability(), 1.0);
        assert_eq!(RandomAuthorizer::new(-0.2).success_probability(), 0.0);
        assert_eq!(RandomAuthorizer::new(f64::NAN).success_probability(), 0.0);
        assert_eq!(RandomAuthorizer::default().success_probability(), 0.8);
    }

    #[tokio::test]
    async fn in_memory_authorizer_follows_script() {
        let authorizer = InMemoryAuthorizer::approving();
        authorizer.push_outcome(PaymentStatus::Failed).await;
        authorizer.fail_next("processor timeout").await;

        assert_eq!(authorizer.authorize(&order()).await.unwrap(), PaymentStatus::Failed);
        assert!(matches!(
            authorizer.authorize(&order()).await,
            Err(ChoreographyError::Authorization(reason)) if reason == "processor timeout"
        ));
        assert_eq!(authorizer.authorize(&order()).await.unwrap(), PaymentStatus::Success);

        assert_eq!(authorizer.charge_count().await, 2);
    }
}
