//! Application configuration loaded from environment variables.

use std::str::FromStr;

use choreography::dispatcher::DEFAULT_MAX_DELIVERY_ATTEMPTS;
use choreography::services::authorizer::DEFAULT_SUCCESS_PROBABILITY;
use choreography::DEFAULT_TRACKED_ORDERS;
use thiserror::Error;

/// Errors raised while reading the environment.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// A variable is set to a value that cannot be parsed.
    #[error("Invalid value for {name}: '{value}' ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    /// A variable required by another setting is not set.
    #[error("{name} is required when {because}")]
    Missing {
        name: &'static str,
        because: &'static str,
    },
}

/// Which stages this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Every stage plus the HTTP gateway.
    All,
    /// HTTP ingress, order stage and saga tracker.
    Gateway,
    /// Payment stage only.
    Payment,
    /// Notification stage only.
    Notification,
}

impl Role {
    pub fn runs_gateway(&self) -> bool {
        matches!(self, Role::All | Role::Gateway)
    }

    pub fn runs_payment(&self) -> bool {
        matches!(self, Role::All | Role::Payment)
    }

    pub fn runs_notification(&self) -> bool {
        matches!(self, Role::All | Role::Notification)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::All => "all",
            Role::Gateway => "gateway",
            Role::Payment => "payment",
            Role::Notification => "notification",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Role::All),
            "gateway" => Ok(Role::Gateway),
            "payment" => Ok(Role::Payment),
            "notification" => Ok(Role::Notification),
            _ => Err("expected all, gateway, payment or notification".to_string()),
        }
    }
}

/// Which broker client to connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerBackend {
    Memory,
    Kafka,
}

impl FromStr for BrokerBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BrokerBackend::Memory),
            "kafka" => Ok(BrokerBackend::Kafka),
            _ => Err("expected memory or kafka".to_string()),
        }
    }
}

/// Where the idempotency stores keep their records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyBackend {
    Memory,
    Postgres,
}

impl FromStr for IdempotencyBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(IdempotencyBackend::Memory),
            "postgres" => Ok(IdempotencyBackend::Postgres),
            _ => Err("expected memory or postgres".to_string()),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err("expected text or json".to_string()),
        }
    }
}

/// Service configuration.
///
/// Reads from environment variables:
/// - `SERVICE_ROLE`: `all`, `gateway`, `payment` or `notification` (default: `all`)
/// - `BROKER_BACKEND`: `memory` or `kafka` (default: `memory`)
/// - `KAFKA_BROKERS`: comma-separated bootstrap servers (default: `localhost:9092`)
/// - `ORDER_CONSUMER_GROUP`, `PAYMENT_CONSUMER_GROUP`, `NOTIFICATION_CONSUMER_GROUP`
/// - `PAYMENT_SUCCESS_PROBABILITY` (default: `0.8`)
/// - `IDEMPOTENCY_BACKEND`: `memory` or `postgres` (default: `memory`)
/// - `DATABASE_URL`: required for the `postgres` backend
/// - `NOTIFICATION_DEDUP` (default: `true`)
/// - `MAX_DELIVERY_ATTEMPTS`: `0` disables dead-letter escalation (default: `5`)
/// - `SAGA_TRACKER_CAPACITY`: orders the gateway remembers (default: `10000`)
/// - `HOST` (default: `"0.0.0.0"`), `PORT` (default: `3000`)
/// - `RUST_LOG` (default: `"info"`), `LOG_FORMAT`: `text` or `json` (default: `text`)
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub role: Role,
    pub broker_backend: BrokerBackend,
    pub kafka_brokers: String,
    pub order_group: String,
    pub payment_group: String,
    pub notification_group: String,
    pub payment_success_probability: f64,
    pub idempotency_backend: IdempotencyBackend,
    pub database_url: Option<String>,
    pub notification_dedup: bool,
    pub max_delivery_attempts: Option<u32>,
    pub tracked_orders: usize,
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup`, falling back to defaults for unset variables.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let string = |name: &str, default: String| lookup(name).unwrap_or(default);

        let probability: f64 = parse(&lookup, "PAYMENT_SUCCESS_PROBABILITY")?
            .unwrap_or(defaults.payment_success_probability);
        if !(0.0..=1.0).contains(&probability) {
            return Err(ConfigError::Invalid {
                name: "PAYMENT_SUCCESS_PROBABILITY",
                value: probability.to_string(),
                reason: "must be between 0 and 1".to_string(),
            });
        }

        let max_delivery_attempts = match parse::<u32, _>(&lookup, "MAX_DELIVERY_ATTEMPTS")? {
            Some(0) => None,
            Some(n) => Some(n),
            None => defaults.max_delivery_attempts,
        };

        let tracked_orders: usize =
            parse(&lookup, "SAGA_TRACKER_CAPACITY")?.unwrap_or(defaults.tracked_orders);
        if tracked_orders == 0 {
            return Err(ConfigError::Invalid {
                name: "SAGA_TRACKER_CAPACITY",
                value: tracked_orders.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let config = Self {
            role: parse(&lookup, "SERVICE_ROLE")?.unwrap_or(defaults.role),
            broker_backend: parse(&lookup, "BROKER_BACKEND")?.unwrap_or(defaults.broker_backend),
            kafka_brokers: string("KAFKA_BROKERS", defaults.kafka_brokers),
            order_group: string("ORDER_CONSUMER_GROUP", defaults.order_group),
            payment_group: string("PAYMENT_CONSUMER_GROUP", defaults.payment_group),
            notification_group: string("NOTIFICATION_CONSUMER_GROUP", defaults.notification_group),
            payment_success_probability: probability,
            idempotency_backend: parse(&lookup, "IDEMPOTENCY_BACKEND")?
                .unwrap_or(defaults.idempotency_backend),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            notification_dedup: parse_flag(&lookup, "NOTIFICATION_DEDUP")?
                .unwrap_or(defaults.notification_dedup),
            max_delivery_attempts,
            tracked_orders,
            host: string("HOST", defaults.host),
            port: parse(&lookup, "PORT")?.unwrap_or(defaults.port),
            log_level: string("RUST_LOG", defaults.log_level),
            log_format: parse(&lookup, "LOG_FORMAT")?.unwrap_or(defaults.log_format),
        };

        if config.idempotency_backend == IdempotencyBackend::Postgres
            && config.database_url.is_none()
        {
            return Err(ConfigError::Missing {
                name: "DATABASE_URL",
                because: "IDEMPOTENCY_BACKEND is postgres",
            });
        }
        Ok(config)
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::All,
            broker_backend: BrokerBackend::Memory,
            kafka_brokers: "localhost:9092".to_string(),
            order_group: "order-consumer-group".to_string(),
            payment_group: "payment-consumer-group".to_string(),
            notification_group: "notification-consumer-group".to_string(),
            payment_success_probability: DEFAULT_SUCCESS_PROBABILITY,
            idempotency_backend: IdempotencyBackend::Memory,
            database_url: None,
            notification_dedup: true,
            max_delivery_attempts: Some(DEFAULT_MAX_DELIVERY_ATTEMPTS),
            tracked_orders: DEFAULT_TRACKED_ORDERS,
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

fn parse<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                name,
                reason: e.to_string(),
                value,
            }),
    }
}

fn parse_flag<F>(lookup: &F, name: &'static str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::Invalid {
                name,
                value,
                reason: "expected true or false".to_string(),
            }),
        },
    }
}
