use common::SmsId;
use domain::SmsStatus;
use thiserror::Error;

/// Errors that can occur when interacting with SMS storage.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No SMS matched the lookup.
    #[error("SMS not found")]
    NotFound,

    /// An SMS with this id already exists.
    #[error("SMS already exists: {0}")]
    AlreadyExists(SmsId),

    /// A guarded update found the record in a different status.
    #[error("Status conflict for SMS {id}: expected {expected}, found {actual}")]
    Conflict {
        id: SmsId,
        expected: SmsStatus,
        actual: SmsStatus,
    },

    /// The outbox entry does not exist.
    #[error("Outbox entry not found: {0}")]
    OutboxEntryNotFound(uuid::Uuid),

    /// A stored row could not be mapped back into the domain.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// The store refused the operation (used by test doubles).
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Returns true if the error is a lost compare-and-swap.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict { .. })
    }

    /// Returns true if nothing matched.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound)
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
