//! SMS status state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::SmsError;

/// The delivery status of an SMS in its lifecycle.
///
/// State transitions:
/// ```text
/// Pending ──┬──► Delivered
///           └──► Failed
/// ```
///
/// Both `Delivered` and `Failed` are terminal; nothing leaves them,
/// including a second delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SmsStatus {
    /// Created and billed (or awaiting billing); not yet handed to a carrier.
    #[default]
    Pending,

    /// The carrier accepted the message (terminal state).
    Delivered,

    /// The carrier rejected the message (terminal state).
    Failed,
}

impl SmsStatus {
    /// Returns true if the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: SmsStatus) -> bool {
        matches!(
            (self, next),
            (SmsStatus::Pending, SmsStatus::Delivered) | (SmsStatus::Pending, SmsStatus::Failed)
        )
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SmsStatus::Delivered | SmsStatus::Failed)
    }

    /// Returns the status name as stored and serialized.
    pub fn as_str(&self) -> &'static str {
        match self {
            SmsStatus::Pending => "pending",
            SmsStatus::Delivered => "delivered",
            SmsStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SmsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SmsStatus {
    type Err = SmsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SmsStatus::Pending),
            "delivered" => Ok(SmsStatus::Delivered),
            "failed" => Ok(SmsStatus::Failed),
            other => Err(SmsError::UnknownStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SmsStatus; 3] = [SmsStatus::Pending, SmsStatus::Delivered, SmsStatus::Failed];

    #[test]
    fn test_default_state_is_pending() {
        assert_eq!(SmsStatus::default(), SmsStatus::Pending);
    }

    #[test]
    fn test_only_pending_can_leave() {
        assert!(SmsStatus::Pending.can_transition_to(SmsStatus::Delivered));
        assert!(SmsStatus::Pending.can_transition_to(SmsStatus::Failed));
        assert!(!SmsStatus::Pending.can_transition_to(SmsStatus::Pending));

        for next in ALL {
            assert!(!SmsStatus::Delivered.can_transition_to(next));
            assert!(!SmsStatus::Failed.can_transition_to(next));
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SmsStatus::Pending.is_terminal());
        assert!(SmsStatus::Delivered.is_terminal());
        assert!(SmsStatus::Failed.is_terminal());
    }

    #[test]
    fn test_display_and_parse_agree() {
        for status in ALL {
            assert_eq!(status.to_string().parse::<SmsStatus>().unwrap(), status);
        }
        assert_eq!(
            "sent".parse::<SmsStatus>(),
            Err(SmsError::UnknownStatus("sent".to_string()))
        );
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_string(&SmsStatus::Delivered).unwrap();
        assert_eq!(json, "\"delivered\"");
        let deserialized: SmsStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, SmsStatus::Delivered);
    }
}
