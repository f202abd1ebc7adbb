use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an SMS message.
///
/// Wraps a UUID so SMS ids cannot be confused with user or transaction ids.
/// Serialized as the hyphenated UUID string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SmsId(Uuid);

impl SmsId {
    /// Creates a new random SMS ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an SMS ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SmsId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SmsId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SmsId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<SmsId> for Uuid {
    fn from(id: SmsId) -> Self {
        id.0
    }
}

/// Error returned when a string is not a valid SMS ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseSmsIdError(String);

impl std::fmt::Display for ParseSmsIdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid SMS id: {}", self.0)
    }
}

impl std::error::Error for ParseSmsIdError {}

impl FromStr for SmsId {
    type Err = ParseSmsIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ParseSmsIdError(s.to_string()))
    }
}

/// Identifier of the user an SMS is sent on behalf of.
///
/// Opaque to this system; issued by the identity/finance domains.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Creates a user ID from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of a debit transaction in the finance domain.
///
/// Refunds reference the transaction that billed the SMS.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    /// Creates a transaction ID from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sms_id_new_creates_unique_ids() {
        let id1 = SmsId::new();
        let id2 = SmsId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn sms_id_from_uuid_preserves_value() {
        let uuid = Uuid::new_v4();
        let id = SmsId::from_uuid(uuid);
        assert_eq!(id.as_uuid(), uuid);
    }

    #[test]
    fn sms_id_parses_its_display_form() {
        let id = SmsId::new();
        let parsed: SmsId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn sms_id_rejects_garbage() {
        let err = "not-a-uuid".parse::<SmsId>().unwrap_err();
        assert_eq!(err.to_string(), "invalid SMS id: not-a-uuid");
    }

    #[test]
    fn sms_id_serializes_as_plain_string() {
        let id = SmsId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }

    #[test]
    fn user_and_transaction_ids_are_transparent() {
        let user = UserId::new("1");
        let txn = TransactionId::from("txn-1");
        assert_eq!(serde_json::to_string(&user).unwrap(), "\"1\"");
        assert_eq!(serde_json::to_string(&txn).unwrap(), "\"txn-1\"");
        assert_eq!(user.as_str(), "1");
        assert_eq!(txn.to_string(), "txn-1");
    }
}
