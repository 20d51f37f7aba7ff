//! Outbound capabilities injected into the stages, with stand-ins.

pub mod authorizer;
pub mod notifier;

pub use authorizer::{InMemoryAuthorizer, PaymentAuthorizer, RandomAuthorizer};
pub use notifier::{InMemoryNotifier, LoggingNotifier, NotificationMessage, Notifier};
