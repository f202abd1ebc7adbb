//! SMS message aggregate.

use chrono::{DateTime, Utc};
use common::{SmsId, UserId};
use serde::{Deserialize, Serialize};

use super::{SmsError, SmsStatus};

/// Failure code recorded when the carrier (MNO) rejects a message.
pub const MNO_PROVIDER_FAILED: &str = "MNOProviderFailed";

/// Maximum content length of a single SMS segment, in characters.
pub const MAX_CONTENT_LENGTH: usize = 160;

/// SMS message aggregate root.
///
/// Identity, owner, content and receiver are fixed at creation. The status
/// moves exactly once, from `Pending` to either `Delivered` or `Failed`, and
/// the carrier fields are only populated by that transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmsMessage {
    id: SmsId,
    user_id: UserId,
    content: String,
    receiver: String,
    provider: Option<String>,
    status: SmsStatus,
    delivered_at: Option<DateTime<Utc>>,
    failure_code: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Plain field bag used by storage adapters to rebuild an [`SmsMessage`].
#[derive(Debug, Clone, PartialEq)]
pub struct SmsParts {
    pub id: SmsId,
    pub user_id: UserId,
    pub content: String,
    pub receiver: String,
    pub provider: Option<String>,
    pub status: SmsStatus,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failure_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SmsMessage {
    /// Creates a new `Pending` SMS after validating its inputs.
    pub fn new(
        user_id: UserId,
        receiver: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Self, SmsError> {
        let receiver = receiver.into();
        let content = content.into();

        if user_id.as_str().trim().is_empty() {
            return Err(SmsError::UserIdRequired);
        }
        validate_receiver(&receiver)?;
        validate_content(&content)?;

        let now = Utc::now();
        Ok(Self {
            id: SmsId::new(),
            user_id,
            content,
            receiver,
            provider: None,
            status: SmsStatus::Pending,
            delivered_at: None,
            failure_code: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Rebuilds a message from persisted fields without validation.
    pub fn restore(parts: SmsParts) -> Self {
        Self {
            id: parts.id,
            user_id: parts.user_id,
            content: parts.content,
            receiver: parts.receiver,
            provider: parts.provider,
            status: parts.status,
            delivered_at: parts.delivered_at,
            failure_code: parts.failure_code,
            created_at: parts.created_at,
            updated_at: parts.updated_at,
        }
    }

    /// Splits the message into its persisted fields.
    pub fn into_parts(self) -> SmsParts {
        SmsParts {
            id: self.id,
            user_id: self.user_id,
            content: self.content,
            receiver: self.receiver,
            provider: self.provider,
            status: self.status,
            delivered_at: self.delivered_at,
            failure_code: self.failure_code,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Records a successful hand-off to the carrier.
    pub fn mark_delivered(&mut self, provider: impl Into<String>) -> Result<(), SmsError> {
        self.ensure_transition(SmsStatus::Delivered)?;
        let now = Utc::now();
        self.status = SmsStatus::Delivered;
        self.provider = Some(provider.into());
        self.delivered_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Records a carrier rejection with the given failure code.
    pub fn mark_failed(
        &mut self,
        provider: impl Into<String>,
        failure_code: impl Into<String>,
    ) -> Result<(), SmsError> {
        self.ensure_transition(SmsStatus::Failed)?;
        self.status = SmsStatus::Failed;
        self.provider = Some(provider.into());
        self.failure_code = Some(failure_code.into());
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Sets the last-modified timestamp. Used by storage adapters on write.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    fn ensure_transition(&self, next: SmsStatus) -> Result<(), SmsError> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(SmsError::InvalidTransition {
                from: self.status,
                to: next,
            })
        }
    }
}

// Query methods
impl SmsMessage {
    /// Returns the SMS id.
    pub fn id(&self) -> SmsId {
        self.id
    }

    /// Returns the owning user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Returns the message body.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Returns the receiver phone number.
    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    /// Returns the carrier that handled the message, once it left `Pending`.
    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    /// Returns the current status.
    pub fn status(&self) -> SmsStatus {
        self.status
    }

    /// Returns when the carrier accepted the message.
    pub fn delivered_at(&self) -> Option<DateTime<Utc>> {
        self.delivered_at
    }

    /// Returns the failure code recorded on rejection.
    pub fn failure_code(&self) -> Option<&str> {
        self.failure_code.as_deref()
    }

    /// Returns the creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the last-modified timestamp.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns true if the message reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// E.164: a leading `+` followed by 8 to 15 digits, first digit non-zero.
fn validate_receiver(receiver: &str) -> Result<(), SmsError> {
    let digits = receiver
        .strip_prefix('+')
        .ok_or_else(|| SmsError::InvalidReceiver(receiver.to_string()))?;

    let valid = (8..=15).contains(&digits.len())
        && digits.chars().all(|c| c.is_ascii_digit())
        && !digits.starts_with('0');

    if valid {
        Ok(())
    } else {
        Err(SmsError::InvalidReceiver(receiver.to_string()))
    }
}

fn validate_content(content: &str) -> Result<(), SmsError> {
    if content.trim().is_empty() {
        return Err(SmsError::EmptyContent);
    }
    let actual = content.chars().count();
    if actual > MAX_CONTENT_LENGTH {
        return Err(SmsError::ContentTooLong {
            actual,
            max: MAX_CONTENT_LENGTH,
        });
    }
    Ok(())
}
