//! Builds the stages a service role runs.

use std::sync::Arc;

use broker::{Broker, BrokerError, InMemoryBroker};
use choreography::{
    ConsumerDispatcher, DeadLetterSink, DispatcherConfig, IdempotencyStore,
    InMemoryIdempotencyStore, LoggingNotifier, NotificationStage, OrderStage, PaymentStage,
    PostgresIdempotencyStore, Publisher, RandomAuthorizer, SagaTracker, TopicDeadLetterSink,
};
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::AppState;
use crate::config::{BrokerBackend, Config, ConfigError, IdempotencyBackend};

/// Errors that stop the process before it starts serving.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("BROKER_BACKEND=kafka requires building with the `kafka` feature")]
    KafkaDisabled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connects the configured broker client.
pub fn connect_broker(config: &Config) -> Result<Arc<dyn Broker>, StartupError> {
    match config.broker_backend {
        BrokerBackend::Memory => {
            if config.role != crate::Role::All {
                tracing::warn!(
                    role = config.role.as_str(),
                    "in-memory broker is process-local; other roles will not see these events"
                );
            }
            Ok(Arc::new(InMemoryBroker::new()))
        }
        #[cfg(feature = "kafka")]
        BrokerBackend::Kafka => Ok(Arc::new(broker::KafkaBroker::new(&config.kafka_brokers)?)),
        #[cfg(not(feature = "kafka"))]
        BrokerBackend::Kafka => Err(StartupError::KafkaDisabled),
    }
}

/// Backend shared by the stages' idempotency stores.
#[derive(Clone)]
pub enum IdempotencyStores {
    Memory,
    Postgres(PostgresIdempotencyStore),
}

impl IdempotencyStores {
    /// Opens a store for one stage.
    ///
    /// In memory every stage gets its own map; in PostgreSQL stages share
    /// the table and are kept apart by key scope.
    pub fn open(&self) -> Arc<dyn IdempotencyStore> {
        match self {
            IdempotencyStores::Memory => Arc::new(InMemoryIdempotencyStore::new()),
            IdempotencyStores::Postgres(store) => Arc::new(store.clone()),
        }
    }
}

/// Connects the configured idempotency backend, running migrations for PostgreSQL.
pub async fn open_stores(config: &Config) -> Result<IdempotencyStores, StartupError> {
    match config.idempotency_backend {
        IdempotencyBackend::Memory => Ok(IdempotencyStores::Memory),
        IdempotencyBackend::Postgres => {
            let url = config.database_url.as_deref().ok_or(ConfigError::Missing {
                name: "DATABASE_URL",
                because: "IDEMPOTENCY_BACKEND is postgres",
            })?;
            let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
            let store = PostgresIdempotencyStore::new(pool);
            store.run_migrations().await?;
            tracing::info!("postgres idempotency store ready");
            Ok(IdempotencyStores::Postgres(store))
        }
    }
}

/// Everything a role runs: HTTP state, dispatchers and the shared publisher.
pub struct Participants {
    pub state: AppState,
    pub dispatchers: Vec<ConsumerDispatcher>,
    pub publisher: Publisher,
}

/// Wires the stages selected by `config.role` onto `broker`.
pub fn assemble(config: &Config, broker: Arc<dyn Broker>, stores: &IdempotencyStores) -> Participants {
    let publisher = Publisher::new(Arc::clone(&broker));
    let dead_letters: Arc<dyn DeadLetterSink> =
        Arc::new(TopicDeadLetterSink::new(Arc::clone(&broker)));
    let dispatcher = |group: &str| {
        ConsumerDispatcher::new(
            Arc::clone(&broker),
            DispatcherConfig::new(group).with_max_delivery_attempts(config.max_delivery_attempts),
        )
        .with_dead_letter_sink(Arc::clone(&dead_letters))
    };

    let mut dispatchers = Vec::new();
    let mut state = AppState {
        role: config.role,
        orders: None,
        tracker: None,
    };

    if config.role.runs_gateway() {
        let tracker = Arc::new(SagaTracker::with_capacity(config.tracked_orders));
        state.orders = Some(Arc::new(OrderStage::new(publisher.clone())));
        state.tracker = Some(Arc::clone(&tracker));
        dispatchers.push(tracker.bind(dispatcher(&config.order_group)));
    }

    if config.role.runs_payment() {
        let stage = Arc::new(PaymentStage::new(
            Arc::new(RandomAuthorizer::new(config.payment_success_probability)),
            stores.open(),
            publisher.clone(),
        ));
        dispatchers.push(stage.bind(dispatcher(&config.payment_group)));
    }

    if config.role.runs_notification() {
        let mut stage = NotificationStage::new(Arc::new(LoggingNotifier), publisher.clone());
        if config.notification_dedup {
            stage = stage.with_idempotency(stores.open());
        }
        dispatchers.push(Arc::new(stage).bind(dispatcher(&config.notification_group)));
    }

    tracing::info!(
        role = config.role.as_str(),
        dispatchers = dispatchers.len(),
        "participants assembled"
    );

    Participants {
        state,
        dispatchers,
        publisher,
    }
}

/// Running dispatchers plus the publisher they emit through.
pub struct Workers {
    stop: watch::Sender<bool>,
    tasks: JoinSet<choreography::Result<()>>,
    publisher: Publisher,
}

impl Workers {
    /// Starts every dispatcher on its own task.
    pub fn spawn(dispatchers: Vec<ConsumerDispatcher>, publisher: Publisher) -> Self {
        let (stop, _) = watch::channel(false);
        let mut tasks = JoinSet::new();
        for dispatcher in dispatchers {
            let mut stop_rx = stop.subscribe();
            tasks.spawn(dispatcher.run(async move {
                let _ = stop_rx.wait_for(|s| *s).await;
            }));
        }
        Self {
            stop,
            tasks,
            publisher,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Stops the dispatchers, waits for them, then flushes outstanding publishes.
    pub async fn shutdown(mut self) {
        self.stop.send_replace(true);
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "dispatcher failed"),
                Err(e) => tracing::error!(error = %e, "dispatcher task panicked"),
            }
        }
        self.publisher.flush().await;
        tracing::info!("workers drained");
    }
}
