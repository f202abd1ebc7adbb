//! Domain layer for the SMS dispatcher.
//!
//! This crate provides:
//! - The `SmsMessage` aggregate and its one-way status state machine
//! - The billing saga events exchanged with the finance domain
//! - The `DomainEvent` trait shared by all published/consumed events

pub mod event;
pub mod sms;

pub use event::DomainEvent;
pub use sms::{
    MAX_CONTENT_LENGTH, MNO_PROVIDER_FAILED, RequestBillingRefund, RequestSmsBilling, SmsBillingCompleted,
    SmsError, SmsEvent, SmsMessage, SmsParts, SmsStatus,
};
