use std::sync::Arc;

use async_trait::async_trait;
use common::SmsId;
use domain::{SmsMessage, SmsStatus};
use uuid::Uuid;

use crate::{OutboxEntry, Result, SmsFilter};

/// Core trait for SMS repositories.
///
/// The repository is the only writer of persisted SMS state and writes only
/// at the direction of the saga service.
#[async_trait]
pub trait SmsRepository: Send + Sync {
    /// Inserts a new SMS record.
    ///
    /// Fails with `AlreadyExists` if the id is taken.
    async fn create(&self, sms: &SmsMessage) -> Result<()>;

    /// Overwrites the SMS record with the given id.
    ///
    /// Fails with `NotFound` if no record has that id.
    async fn update(&self, id: SmsId, sms: &SmsMessage) -> Result<()>;

    /// Overwrites the record only if it is currently in `expected` status.
    ///
    /// Fails with `Conflict` when another writer moved the record first.
    async fn update_if_status(
        &self,
        id: SmsId,
        expected: SmsStatus,
        sms: &SmsMessage,
    ) -> Result<()>;

    /// Returns the oldest record matching the filter.
    ///
    /// Fails with `NotFound` when nothing matches.
    async fn get_by_filter(&self, filter: SmsFilter) -> Result<SmsMessage>;

    /// Starts a unit of work. Dropping it without `commit` discards it.
    async fn begin(&self) -> Result<Box<dyn SmsTransaction>>;
}

/// A unit of work spanning SMS writes and outbox entries.
///
/// Either every staged write becomes visible on `commit` or none does.
#[async_trait]
pub trait SmsTransaction: Send {
    /// Stages a new SMS record.
    async fn create(&mut self, sms: &SmsMessage) -> Result<()>;

    /// Stages a guarded overwrite (see [`SmsRepository::update_if_status`]).
    async fn update_if_status(
        &mut self,
        id: SmsId,
        expected: SmsStatus,
        sms: &SmsMessage,
    ) -> Result<()>;

    /// Stages an outbox entry.
    async fn enqueue(&mut self, entry: OutboxEntry) -> Result<()>;

    /// Makes every staged write visible atomically.
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Access to undispatched outbox entries.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Returns up to `limit` undispatched entries, oldest first.
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    /// Marks an entry as published.
    async fn mark_dispatched(&self, id: Uuid) -> Result<()>;

    /// Records a failed publish attempt on an entry.
    async fn record_failure(&self, id: Uuid, error: &str) -> Result<()>;
}

/// A store offering both SMS records and their outbox.
pub trait SmsStore: SmsRepository + OutboxStore {}

impl<T: SmsRepository + OutboxStore + ?Sized> SmsStore for T {}

/// Extension trait providing convenience lookups.
#[async_trait]
pub trait SmsRepositoryExt: SmsRepository {
    /// Loads an SMS by id.
    async fn find_by_id(&self, id: SmsId) -> Result<SmsMessage> {
        self.get_by_filter(SmsFilter::by_id(id)).await
    }

    /// Checks if an SMS with this id exists.
    async fn exists(&self, id: SmsId) -> Result<bool> {
        match self.find_by_id(id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl<T: SmsRepository + ?Sized> SmsRepositoryExt for T {}

#[async_trait]
impl<T: SmsRepository + ?Sized> SmsRepository for Arc<T> {
    async fn create(&self, sms: &SmsMessage) -> Result<()> {
        (**self).create(sms).await
    }

    async fn update(&self, id: SmsId, sms: &SmsMessage) -> Result<()> {
        (**self).update(id, sms).await
    }

    async fn update_if_status(
        &self,
        id: SmsId,
        expected: SmsStatus,
        sms: &SmsMessage,
    ) -> Result<()> {
        (**self).update_if_status(id, expected, sms).await
    }

    async fn get_by_filter(&self, filter: SmsFilter) -> Result<SmsMessage> {
        (**self).get_by_filter(filter).await
    }

    async fn begin(&self) -> Result<Box<dyn SmsTransaction>> {
        (**self).begin().await
    }
}

#[async_trait]
impl<T: OutboxStore + ?Sized> OutboxStore for Arc<T> {
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        (**self).pending_outbox(limit).await
    }

    async fn mark_dispatched(&self, id: Uuid) -> Result<()> {
        (**self).mark_dispatched(id).await
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<()> {
        (**self).record_failure(id, error).await
    }
}
