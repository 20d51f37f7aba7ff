//! Notification channel trait and implementations.

use std::sync::Arc;

use async_trait::async_trait;
use domain::CustomerContact;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::{ChoreographyError, Result};

/// A message for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationMessage {
    pub recipient: CustomerContact,
    pub subject: String,
    pub body: String,
}

/// Trait for outbound notification channels (email, SMS, ...).
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Hands a message to the channel.
    async fn send(&self, message: &NotificationMessage) -> Result<()>;
}

/// Logs messages instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn send(&self, message: &NotificationMessage) -> Result<()> {
        tracing::info!(
            recipient = %message.recipient,
            subject = %message.subject,
            body = %message.body,
            "notification sent"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
struct InMemoryNotifierState {
    sent: Vec<NotificationMessage>,
    failures: u32,
}

/// Records messages in memory for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotifier {
    state: Arc<Mutex<InMemoryNotifierState>>,
}

impl InMemoryNotifier {
    /// Creates a new in-memory notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` sends fail.
    pub async fn fail_next(&self, count: u32) {
        self.state.lock().await.failures += count;
    }

    /// Returns every message sent so far.
    pub async fn sent(&self) -> Vec<NotificationMessage> {
        self.state.lock().await.sent.clone()
    }

    /// Returns the number of messages sent.
    pub async fn sent_count(&self) -> usize {
        self.state.lock().await.sent.len()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn send(&self, message: &NotificationMessage) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.failures > 0 {
            state.failures -= 1;
            return Err(ChoreographyError::Notification(format!(
                "channel rejected message to {}",
                message.recipient
            )));
        }
        state.sent.push(message.clone());
        Ok(())
    }
}
