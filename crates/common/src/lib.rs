//! Identifier types shared across the SMS dispatcher crates.

pub mod types;

pub use types::{ParseSmsIdError, SmsId, TransactionId, UserId};
