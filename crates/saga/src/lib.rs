//! SMS billing saga.
//!
//! This crate coordinates an SMS across the finance domain:
//! 1. Persist the SMS and request billing
//! 2. On billing completion, hand the SMS to a carrier
//! 3. If the carrier refuses, mark the SMS failed and request a refund
//!
//! Outgoing events go through a transactional outbox; the [`OutboxRelay`]
//! republishes anything the saga could not publish itself.

pub mod error;
pub mod handler;
pub mod provider;
pub mod relay;
pub mod service;

pub use error::{Result, SagaError};
pub use handler::BillingCompletedHandler;
pub use provider::{
    ALWAYS_FAIL_PROVIDER, DeliveryProvider, FailureStrategy, FnProvider, MOCK_PROVIDER,
    ProviderError, RANDOM_FAIL_PROVIDER, SimulatedProvider,
};
pub use relay::{OutboxRelay, RelayConfig, RelayReport};
pub use service::{CreateOutcome, ProcessOutcome, SagaConfig, SmsSagaService};
