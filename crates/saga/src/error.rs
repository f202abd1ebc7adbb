//! Saga error types.

use common::SmsId;
use domain::SmsError;
use messaging::PublishError;
use storage::StorageError;
use thiserror::Error;

/// Errors that can occur while driving the SMS billing saga.
///
/// A carrier rejecting a message is not an error here; it is a regular
/// saga outcome that ends in a refund.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Repository I/O failed.
    #[error("Persistence error: {0}")]
    Persistence(#[from] StorageError),

    /// No SMS with this id exists (yet).
    #[error("SMS not found: {0}")]
    NotFound(SmsId),

    /// An event could not be published.
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    /// The requested status change is not allowed.
    #[error("Domain error: {0}")]
    Domain(#[from] SmsError),

    /// An inbound payload could not be decoded.
    #[error("Invalid payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl SagaError {
    /// Maps a storage error, turning a missing record into `NotFound`.
    pub(crate) fn from_lookup(id: SmsId, error: StorageError) -> Self {
        if error.is_not_found() {
            SagaError::NotFound(id)
        } else {
            SagaError::Persistence(error)
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
