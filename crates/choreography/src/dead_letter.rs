//! Destinations for records the dispatcher gives up on.

use std::sync::Arc;

use async_trait::async_trait;
use broker::{Broker, Delivery, Record};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::topics;

/// Why a record was dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DeadLetterReason {
    /// The bytes are not a valid envelope.
    Undecodable { error: String },

    /// The handler failed with an error redelivery cannot fix.
    NonRetryable { error: String },

    /// The handler kept failing.
    RetriesExhausted {
        attempts: u32,
        #[serde(rename = "lastError")]
        last_error: String,
    },
}

impl DeadLetterReason {
    /// Returns the reason name used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::Undecodable { .. } => "undecodable",
            DeadLetterReason::NonRetryable { .. } => "non_retryable",
            DeadLetterReason::RetriesExhausted { .. } => "retries_exhausted",
        }
    }
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadLetterReason::Undecodable { error } => write!(f, "undecodable: {error}"),
            DeadLetterReason::NonRetryable { error } => write!(f, "non-retryable: {error}"),
            DeadLetterReason::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "gave up after {attempts} attempts: {last_error}"),
        }
    }
}

/// A record that will not be processed, with enough context to replay it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// The raw record body, lossily decoded as UTF-8.
    pub payload: String,
    pub reason: DeadLetterReason,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Captures a delivery and the reason it failed.
    pub fn new(delivery: &Delivery, reason: DeadLetterReason) -> Self {
        Self {
            topic: delivery.topic.clone(),
            partition: delivery.partition,
            offset: delivery.offset,
            key: delivery.key.clone(),
            payload: String::from_utf8_lossy(&delivery.payload).into_owned(),
            reason,
            failed_at: Utc::now(),
        }
    }
}

/// Trait for dead-letter destinations.
///
/// Sinks report their own failures; the dispatcher acknowledges the record
/// once `send` returns.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Accepts a dead letter.
    async fn send(&self, letter: DeadLetter);
}

/// Logs dead letters at error severity and drops them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LoggingDeadLetterSink {
    async fn send(&self, letter: DeadLetter) {
        tracing::error!(
            topic = %letter.topic,
            partition = letter.partition,
            offset = letter.offset,
            key = ?letter.key,
            reason = %letter.reason,
            payload = %letter.payload,
            "record dead-lettered"
        );
        metrics::counter!(
            "dead_letters_total",
            "topic" => letter.topic.clone(),
            "reason" => letter.reason.as_str()
        )
        .increment(1);
    }
}

/// Logs dead letters and appends them as JSON to a dead-letter topic.
pub struct TopicDeadLetterSink {
    broker: Arc<dyn Broker>,
    topic: String,
}

impl TopicDeadLetterSink {
    /// Creates a sink writing to the default `dead-letters` topic.
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::with_topic(broker, topics::DEAD_LETTERS)
    }

    /// Creates a sink writing to the given topic.
    pub fn with_topic(broker: Arc<dyn Broker>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
        }
    }

    /// Returns the dead-letter topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl DeadLetterSink for TopicDeadLetterSink {
    async fn send(&self, letter: DeadLetter) {
        LoggingDeadLetterSink.send(letter.clone()).await;

        let payload = match serde_json::to_vec(&letter) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::error!(error = %error, "failed to encode dead letter");
                return;
            }
        };
        // Keyless records are keyed by their origin partition.
        let key = letter
            .key
            .clone()
            .unwrap_or_else(|| format!("{}-{}", letter.topic, letter.partition));

        if let Err(error) = self.broker.publish(&self.topic, Record::new(key, payload)).await {
            tracing::error!(
                dead_letter_topic = %self.topic,
                topic = %letter.topic,
                offset = letter.offset,
                error = %error,
                "failed to publish dead letter"
            );
        }
    }
}

/// Records dead letters in memory, for tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeadLetterSink {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetterSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every letter received so far.
    pub async fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().await.clone()
    }

    /// Returns the number of letters received.
    pub async fn len(&self) -> usize {
        self.letters.lock().await.len()
    }

    /// Returns true if no letter was received.
    pub async fn is_empty(&self) -> bool {
        self.letters.lock().await.is_empty()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn send(&self, letter: DeadLetter) {
        self.letters.lock().await.push(letter);
    }
}
