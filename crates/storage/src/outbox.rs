//! Transactional outbox entries.
//!
//! An entry is written in the same unit of work as the SMS change that
//! produced it, so an event can never be lost between commit and publish.

use chrono::{DateTime, Utc};
use domain::{DomainEvent, SmsEvent};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;

/// An event waiting to be (re)published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub event_type: String,
    pub aggregate_id: String,
    /// The tagged `SmsEvent` envelope.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    /// Failed publish attempts so far.
    pub attempts: i32,
    pub last_error: Option<String>,
}

impl OutboxEntry {
    /// Wraps an event for the outbox.
    pub fn for_event(event: &SmsEvent) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            event_type: event.event_type().to_string(),
            aggregate_id: event.aggregate_id(),
            payload: serde_json::to_value(event)?,
            created_at: Utc::now(),
            dispatched_at: None,
            attempts: 0,
            last_error: None,
        })
    }

    /// Decodes the stored event.
    pub fn event(&self) -> Result<SmsEvent> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Time since the entry was written. Zero if the clock went backwards.
    pub fn age(&self) -> std::time::Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or_default()
    }

    /// Returns true once the event reached the broker.
    pub fn is_dispatched(&self) -> bool {
        self.dispatched_at.is_some()
    }

    pub(crate) fn mark_dispatched(&mut self, at: DateTime<Utc>) {
        self.dispatched_at = Some(at);
        self.last_error = None;
    }

    pub(crate) fn mark_failed(&mut self, error: &str) {
        self.attempts += 1;
        self.last_error = Some(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::TransactionId;

    #[test]
    fn entry_carries_event_identity() {
        let event = SmsEvent::billing_refund(TransactionId::new("txn-1"));
        let entry = OutboxEntry::for_event(&event).unwrap();

        assert_eq!(entry.event_type, "BillingRefunded");
        assert_eq!(entry.aggregate_id, "txn-1");
        assert!(!entry.is_dispatched());
        assert_eq!(entry.event().unwrap(), event);
    }

    #[test]
    fn failures_accumulate_until_dispatched() {
        let event = SmsEvent::billing_refund(TransactionId::new("txn-1"));
        let mut entry = OutboxEntry::for_event(&event).unwrap();

        entry.mark_failed("broker down");
        entry.mark_failed("broker still down");
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.last_error.as_deref(), Some("broker still down"));

        entry.mark_dispatched(Utc::now());
        assert!(entry.is_dispatched());
        assert!(entry.last_error.is_none());
        assert_eq!(entry.attempts, 2);
    }

    #[test]
    fn age_counts_from_creation() {
        let event = SmsEvent::billing_refund(TransactionId::new("txn-1"));
        let mut entry = OutboxEntry::for_event(&event).unwrap();
        assert!(entry.age() < std::time::Duration::from_secs(1));

        entry.created_at = Utc::now() - chrono::Duration::seconds(30);
        assert!(entry.age() >= std::time::Duration::from_secs(30));

        entry.created_at = Utc::now() + chrono::Duration::seconds(30);
        assert_eq!(entry.age(), std::time::Duration::ZERO);
    }
}
