//! The three participants of the order saga.

pub mod notification;
pub mod order;
pub mod payment;

pub use notification::NotificationStage;
pub use order::{OrderStage, ReceiptStatus, SubmitReceipt};
pub use payment::PaymentStage;
