//! Billing saga events exchanged with the finance domain.
//!
//! Payload field names are part of the cross-service wire contract and are
//! serialized verbatim (`UserID`, `SMSID`, `Amount`, `TransactionID`,
//! `TimeStamp`).

use chrono::{DateTime, Utc};
use common::{SmsId, TransactionId, UserId};
use serde::{Deserialize, Serialize};

use crate::event::DomainEvent;

/// Events of the SMS billing saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SmsEvent {
    /// Ask finance to debit the user for an SMS.
    RequestSmsBilling(RequestSmsBilling),

    /// Finance debited the user (inbound).
    SmsBillingCompleted(SmsBillingCompleted),

    /// Ask finance to reverse a debit after delivery failed.
    RequestBillingRefund(RequestBillingRefund),
}

impl SmsEvent {
    /// Builds a billing request for a freshly created SMS.
    pub fn billing_requested(user_id: UserId, sms_id: SmsId, amount: i64) -> Self {
        SmsEvent::RequestSmsBilling(RequestSmsBilling {
            user_id,
            sms_id,
            amount,
            timestamp: Utc::now(),
        })
    }

    /// Builds a refund request for the given debit transaction.
    pub fn billing_refund(transaction_id: TransactionId) -> Self {
        SmsEvent::RequestBillingRefund(RequestBillingRefund {
            transaction_id,
            timestamp: Utc::now(),
        })
    }

    /// Serializes the bare payload as it travels on the wire.
    pub fn to_wire(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            SmsEvent::RequestSmsBilling(data) => serde_json::to_vec(data),
            SmsEvent::SmsBillingCompleted(data) => serde_json::to_vec(data),
            SmsEvent::RequestBillingRefund(data) => serde_json::to_vec(data),
        }
    }
}

impl DomainEvent for SmsEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SmsEvent::RequestSmsBilling(_) => "BillingRequested",
            SmsEvent::SmsBillingCompleted(_) => "BillingCompleted",
            SmsEvent::RequestBillingRefund(_) => "BillingRefunded",
        }
    }

    fn aggregate_id(&self) -> String {
        match self {
            SmsEvent::RequestSmsBilling(data) => data.sms_id.to_string(),
            SmsEvent::SmsBillingCompleted(data) => data.sms_id.to_string(),
            SmsEvent::RequestBillingRefund(data) => data.transaction_id.to_string(),
        }
    }

    fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SmsEvent::RequestSmsBilling(data) => data.timestamp,
            SmsEvent::SmsBillingCompleted(data) => data.timestamp,
            SmsEvent::RequestBillingRefund(data) => data.timestamp,
        }
    }
}

/// Payload of `BillingRequested`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSmsBilling {
    #[serde(rename = "UserID")]
    pub user_id: UserId,

    #[serde(rename = "SMSID")]
    pub sms_id: SmsId,

    /// Units to debit.
    #[serde(rename = "Amount")]
    pub amount: i64,

    #[serde(rename = "TimeStamp")]
    pub timestamp: DateTime<Utc>,
}

/// Payload of `BillingCompleted`, published by finance once the debit
/// went through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmsBillingCompleted {
    #[serde(rename = "UserID")]
    pub user_id: UserId,

    #[serde(rename = "SMSID")]
    pub sms_id: SmsId,

    #[serde(rename = "Amount")]
    pub amount: i64,

    /// Debit transaction to reference in a refund.
    #[serde(rename = "TransactionID")]
    pub transaction_id: TransactionId,

    #[serde(rename = "TimeStamp", default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Payload of `BillingRefunded`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBillingRefund {
    #[serde(rename = "TransactionID")]
    pub transaction_id: TransactionId,

    #[serde(rename = "TimeStamp")]
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn billing_request_wire_uses_contract_field_names() {
        let sms_id = SmsId::new();
        let event = SmsEvent::billing_requested(UserId::new("1"), sms_id, 1);

        let wire: Value = serde_json::from_slice(&event.to_wire().unwrap()).unwrap();
        assert_eq!(wire["UserID"], "1");
        assert_eq!(wire["SMSID"], sms_id.to_string());
        assert_eq!(wire["Amount"], 1);
        assert!(wire["TimeStamp"].is_string());
        assert!(wire.get("type").is_none());
    }

    #[test]
    fn refund_aggregate_is_the_transaction() {
        let event = SmsEvent::billing_refund(TransactionId::new("txn-1"));
        assert_eq!(event.event_type(), "BillingRefunded");
        assert_eq!(event.aggregate_id(), "txn-1");

        let wire: Value = serde_json::from_slice(&event.to_wire().unwrap()).unwrap();
        assert_eq!(wire["TransactionID"], "txn-1");
    }

    #[test]
    fn billing_completed_parses_finance_payload() {
        let sms_id = SmsId::new();
        let body = format!(
            r#"{{"UserID":"1","SMSID":"{sms_id}","Amount":1,"TransactionID":"txn-1","TimeStamp":"2024-01-01T00:00:00Z"}}"#
        );

        let completed: SmsBillingCompleted = serde_json::from_str(&body).unwrap();
        assert_eq!(completed.sms_id, sms_id);
        assert_eq!(completed.transaction_id.as_str(), "txn-1");

        let event = SmsEvent::SmsBillingCompleted(completed);
        assert_eq!(event.event_type(), "BillingCompleted");
        assert_eq!(event.aggregate_id(), sms_id.to_string());
    }

    #[test]
    fn billing_completed_tolerates_missing_timestamp() {
        let body = format!(
            r#"{{"UserID":"1","SMSID":"{}","Amount":1,"TransactionID":"txn-1"}}"#,
            SmsId::new()
        );
        assert!(serde_json::from_str::<SmsBillingCompleted>(&body).is_ok());
    }

    #[test]
    fn envelope_serialization_is_tagged() {
        let event = SmsEvent::billing_refund(TransactionId::new("txn-1"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "RequestBillingRefund");

        let back: SmsEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
