//! SMS aggregate and related types.

mod events;
mod message;
mod state;

pub use events::{RequestBillingRefund, RequestSmsBilling, SmsBillingCompleted, SmsEvent};
pub use message::{MAX_CONTENT_LENGTH, MNO_PROVIDER_FAILED, SmsMessage, SmsParts};
pub use state::SmsStatus;

use thiserror::Error;

/// Errors that can occur during SMS operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SmsError {
    /// The requested status transition is not part of the lifecycle.
    #[error("Invalid status transition: cannot move from {from} to {to}")]
    InvalidTransition { from: SmsStatus, to: SmsStatus },

    /// A stored status string is not recognised.
    #[error("Unknown SMS status: {0}")]
    UnknownStatus(String),

    /// User ID is required.
    #[error("User ID is required")]
    UserIdRequired,

    /// Receiver is not an E.164 phone number.
    #[error("Invalid receiver: {0} (expected E.164, e.g. +1234567890)")]
    InvalidReceiver(String),

    /// Content is empty.
    #[error("SMS content must not be empty")]
    EmptyContent,

    /// Content is longer than a single SMS segment.
    #[error("SMS content too long: {actual} characters (max {max})")]
    ContentTooLong { actual: usize, max: usize },
}
