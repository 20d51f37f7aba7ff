//! Topic names shared by every producer and consumer.
//!
//! `payment-succeeded` carries both SUCCESS and FAILED outcomes; the name is
//! historical and means "the payment stage finished".

/// New orders, emitted by the order stage.
pub const ORDER_CREATED: &str = "order_created";

/// Reserved by the naming convention. Nothing publishes to it.
pub const PROCESS_PAYMENT: &str = "process_payment";

/// Payment outcomes, emitted by the payment stage.
pub const PAYMENT_SUCCEEDED: &str = "payment-succeeded";

/// Notification records, emitted by the notification stage.
pub const NOTIFICATION_OUTCOMES: &str = "notification-outcomes";

/// Records the dispatcher gave up on.
pub const DEAD_LETTERS: &str = "dead-letters";
