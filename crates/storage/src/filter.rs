use common::{SmsId, UserId};
use domain::{SmsMessage, SmsStatus};

/// Lookup criteria for SMS records.
///
/// Every set field must match. An empty filter matches any record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmsFilter {
    /// Filter by SMS id.
    pub id: Option<SmsId>,

    /// Filter by status.
    pub status: Option<SmsStatus>,

    /// Filter by owning user.
    pub user_id: Option<UserId>,
}

impl SmsFilter {
    /// Creates a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a filter for a specific SMS.
    pub fn by_id(id: SmsId) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    /// Filters by SMS id.
    pub fn id(mut self, id: SmsId) -> Self {
        self.id = Some(id);
        self
    }

    /// Filters by status.
    pub fn status(mut self, status: SmsStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filters by owning user.
    pub fn user_id(mut self, user_id: impl Into<UserId>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Returns true if `sms` satisfies every set criterion.
    pub fn matches(&self, sms: &SmsMessage) -> bool {
        if let Some(id) = self.id
            && sms.id() != id
        {
            return false;
        }
        if let Some(status) = self.status
            && sms.status() != status
        {
            return false;
        }
        if let Some(ref user_id) = self.user_id
            && sms.user_id() != user_id
        {
            return false;
        }
        true
    }
}
