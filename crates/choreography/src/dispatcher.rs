//! Consumer dispatcher: binds `(topic, event type)` pairs to handlers.
//!
//! One worker task runs per assigned partition and handles its records
//! strictly one after another, which preserves per-order ordering while
//! different partitions proceed concurrently. For every record the worker:
//!
//! 1. decodes the envelope (undecodable → dead letter, commit)
//! 2. looks up the handler (unbound → commit, ignored)
//! 3. runs the handler to completion
//! 4. commits on success, or rewinds and backs off on failure until the
//!    attempt limit routes the record to the dead-letter sink

use std::collections::{BTreeSet, HashMap};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use broker::{Broker, Delivery, EventEnvelope, EventType, PartitionConsumer};
use futures_util::{FutureExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::dead_letter::{DeadLetter, DeadLetterReason, DeadLetterSink, LoggingDeadLetterSink};
use crate::error::{ChoreographyError, Result};
use crate::retry::RedeliveryPolicy;

/// Default number of attempts before a failing record is dead-lettered.
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// Trait for event handlers.
///
/// Handlers must tolerate the same envelope being delivered more than once.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Processes one envelope. An error fails the dispatch.
    async fn handle(&self, envelope: &EventEnvelope) -> Result<()>;
}

/// What the dispatcher did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchOutcome {
    /// The handler succeeded; the offset was committed.
    Acked,
    /// The handler failed; the record will be delivered again.
    Redelivering,
    /// The record went to the dead-letter sink; the offset was committed.
    DeadLettered,
    /// No handler is bound to the event type; the offset was committed.
    Ignored,
}

impl DispatchOutcome {
    /// Returns the outcome name used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Acked => "acked",
            DispatchOutcome::Redelivering => "redelivering",
            DispatchOutcome::DeadLettered => "dead_lettered",
            DispatchOutcome::Ignored => "ignored",
        }
    }

    /// Returns true if the offset should be committed.
    pub fn commits(&self) -> bool {
        !matches!(self, DispatchOutcome::Redelivering)
    }
}

impl std::fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Consumer group the dispatcher joins.
    pub group: String,
    /// Backoff between redeliveries.
    pub redelivery: RedeliveryPolicy,
    /// Attempts before dead-lettering. `None` redelivers forever.
    pub max_delivery_attempts: Option<u32>,
}

impl DispatcherConfig {
    /// Creates a config for a consumer group with default redelivery settings.
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            redelivery: RedeliveryPolicy::default(),
            max_delivery_attempts: Some(DEFAULT_MAX_DELIVERY_ATTEMPTS),
        }
    }

    /// Sets the redelivery backoff.
    pub fn with_redelivery(mut self, redelivery: RedeliveryPolicy) -> Self {
        self.redelivery = redelivery;
        self
    }

    /// Sets the attempt limit. `None` (or `Some(0)`) disables dead-lettering on failure.
    pub fn with_max_delivery_attempts(mut self, max: Option<u32>) -> Self {
        self.max_delivery_attempts = max.filter(|max| *max > 0);
        self
    }
}

type Bindings = HashMap<(String, EventType), Arc<dyn EventHandler>>;

/// Routes records from a consumer group to bound handlers.
pub struct ConsumerDispatcher {
    broker: Arc<dyn Broker>,
    config: DispatcherConfig,
    bindings: Bindings,
    dead_letters: Arc<dyn DeadLetterSink>,
}

impl ConsumerDispatcher {
    /// Creates a dispatcher with no bindings, logging dead letters.
    pub fn new(broker: Arc<dyn Broker>, config: DispatcherConfig) -> Self {
        Self {
            broker,
            config,
            bindings: HashMap::new(),
            dead_letters: Arc::new(LoggingDeadLetterSink),
        }
    }

    /// Replaces the dead-letter sink.
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = sink;
        self
    }

    /// Binds a handler to an event type arriving on a topic.
    ///
    /// A later binding of the same pair replaces the earlier one.
    pub fn bind(
        mut self,
        topic: impl Into<String>,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        self.bindings.insert((topic.into(), event_type), handler);
        self
    }

    /// Returns the consumer group.
    pub fn group(&self) -> &str {
        &self.config.group
    }

    /// Returns the distinct topics with at least one binding, sorted.
    pub fn topics(&self) -> Vec<String> {
        self.bindings
            .keys()
            .map(|(topic, _)| topic.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Subscribes and dispatches until `shutdown` completes.
    ///
    /// On shutdown no new records are pulled, in-flight handlers run to
    /// completion, and all partition workers are joined before returning.
    #[tracing::instrument(skip_all, fields(group = %self.config.group))]
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let topics = self.topics();
        if topics.is_empty() {
            tracing::warn!("dispatcher has no bindings");
            shutdown.await;
            return Ok(());
        }
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        let mut assignments = self
            .broker
            .subscribe(&self.config.group, &topic_refs)
            .await
            .map_err(ChoreographyError::Broker)?;
        tracing::info!(?topics, "dispatcher started");

        let context = Arc::new(DispatchContext {
            group: self.config.group.clone(),
            bindings: self.bindings,
            dead_letters: self.dead_letters,
            redelivery: self.config.redelivery,
            max_delivery_attempts: self.config.max_delivery_attempts,
        });
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut workers = JoinSet::new();
        let mut assignments_open = true;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                next = assignments.next(), if assignments_open => match next {
                    Some(consumer) => {
                        workers.spawn(run_partition(
                            Arc::clone(&context),
                            consumer,
                            stop_rx.clone(),
                        ));
                    }
                    None => assignments_open = false,
                },
                joined = workers.join_next(), if !workers.is_empty() => {
                    log_join(joined);
                    if !assignments_open && workers.is_empty() {
                        tracing::info!("all partitions closed");
                        break;
                    }
                }
            }
        }

        stop_tx.send_replace(true);
        while let Some(joined) = workers.join_next().await {
            log_join(Some(joined));
        }
        tracing::info!("dispatcher stopped");
        Ok(())
    }
}

fn log_join(joined: Option<std::result::Result<(), tokio::task::JoinError>>) {
    if let Some(Err(error)) = joined {
        tracing::error!(error = %error, "partition worker panicked");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct DispatchContext {
    group: String,
    bindings: Bindings,
    dead_letters: Arc<dyn DeadLetterSink>,
    redelivery: RedeliveryPolicy,
    max_delivery_attempts: Option<u32>,
}

impl DispatchContext {
    async fn dispatch(&self, delivery: &Delivery, attempt: u32) -> DispatchOutcome {
        let envelope = match EventEnvelope::decode(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(error) => {
                let reason = DeadLetterReason::Undecodable {
                    error: error.to_string(),
                };
                self.dead_letters
                    .send(DeadLetter::new(delivery, reason))
                    .await;
                self.record(delivery, None, DispatchOutcome::DeadLettered);
                return DispatchOutcome::DeadLettered;
            }
        };

        let binding = (delivery.topic.clone(), envelope.event_type());
        let Some(handler) = self.bindings.get(&binding) else {
            self.record(delivery, Some(&envelope), DispatchOutcome::Ignored);
            return DispatchOutcome::Ignored;
        };

        let handled = AssertUnwindSafe(handler.handle(&envelope))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(ChoreographyError::HandlerPanicked(panic_message(&*panic)))
            });

        let outcome = match handled {
            Ok(()) => DispatchOutcome::Acked,
            Err(error) if !error.is_retryable() => {
                let reason = DeadLetterReason::NonRetryable {
                    error: error.to_string(),
                };
                self.dead_letters
                    .send(DeadLetter::new(delivery, reason))
                    .await;
                DispatchOutcome::DeadLettered
            }
            Err(error) => match self.max_delivery_attempts {
                Some(max) if attempt >= max => {
                    let reason = DeadLetterReason::RetriesExhausted {
                        attempts: attempt,
                        last_error: error.to_string(),
                    };
                    self.dead_letters
                        .send(DeadLetter::new(delivery, reason))
                        .await;
                    DispatchOutcome::DeadLettered
                }
                _ => {
                    tracing::warn!(
                        topic = %delivery.topic,
                        partition = delivery.partition,
                        offset = delivery.offset,
                        order_id = %envelope.order_id(),
                        attempt,
                        error = %error,
                        "handler failed"
                    );
                    DispatchOutcome::Redelivering
                }
            },
        };

        self.record(delivery, Some(&envelope), outcome);
        outcome
    }

    fn record(
        &self,
        delivery: &Delivery,
        envelope: Option<&EventEnvelope>,
        outcome: DispatchOutcome,
    ) {
        let event_type = envelope.map(|e| e.event_type().as_str()).unwrap_or("unknown");
        let order_id = envelope.map(|e| e.order_id().as_str()).unwrap_or("");

        if outcome == DispatchOutcome::Ignored {
            tracing::debug!(
                topic = %delivery.topic,
                partition = delivery.partition,
                offset = delivery.offset,
                event_type,
                order_id,
                outcome = outcome.as_str(),
                "delivery dispatched"
            );
        } else {
            tracing::info!(
                topic = %delivery.topic,
                partition = delivery.partition,
                offset = delivery.offset,
                event_type,
                order_id,
                outcome = outcome.as_str(),
                "delivery dispatched"
            );
        }

        metrics::counter!(
            "dispatcher_deliveries_total",
            "group" => self.group.clone(),
            "topic" => delivery.topic.clone(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
    }
}

async fn run_partition(
    context: Arc<DispatchContext>,
    mut consumer: Box<dyn PartitionConsumer>,
    mut stop: watch::Receiver<bool>,
) {
    let topic = consumer.topic().to_string();
    let partition = consumer.partition();
    tracing::debug!(group = %context.group, %topic, partition, "partition worker started");

    // Consecutive failed attempts of the record at `retrying`.
    let mut attempts: u32 = 0;
    let mut retrying: Option<u64> = None;

    loop {
        let delivery = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => break,
            next = consumer.next_delivery() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };

        if retrying != Some(delivery.offset) {
            attempts = 0;
        }
        attempts = attempts.saturating_add(1);

        let started = Instant::now();
        let outcome = context.dispatch(&delivery, attempts).await;
        metrics::histogram!("dispatch_duration_seconds", "topic" => topic.clone())
            .record(started.elapsed().as_secs_f64());

        if outcome.commits() {
            retrying = None;
            if let Err(error) = consumer.commit(&delivery).await {
                tracing::warn!(%topic, partition, offset = delivery.offset, error = %error, "commit failed");
            }
            continue;
        }

        retrying = Some(delivery.offset);
        if let Err(error) = consumer.redeliver(&delivery).await {
            tracing::warn!(%topic, partition, offset = delivery.offset, error = %error, "redelivery failed");
        }
        let delay = context.redelivery.delay_for_attempt(attempts);
        tokio::select! {
            _ = stop.wait_for(|stopped| *stopped) => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::debug!(group = %context.group, %topic, partition, "partition worker stopped");
}
