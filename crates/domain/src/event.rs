//! Core domain event trait.

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};

/// Trait for domain events.
///
/// Domain events represent facts that have happened in the domain.
/// They are immutable and named in past tense (or as explicit requests
/// when they cross into another domain).
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Returns the event type name.
    fn event_type(&self) -> &'static str;

    /// Returns the id of the aggregate the event is about.
    ///
    /// For SMS events this is the SMS id; for refunds it is the
    /// finance transaction id.
    fn aggregate_id(&self) -> String;

    /// Returns when the event was created.
    fn timestamp(&self) -> DateTime<Utc>;
}
