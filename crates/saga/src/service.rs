//! The SMS billing saga.
//!
//! `create_and_bill_sms` persists an SMS together with its billing request
//! and publishes the request. `process_debited_sms` reacts to finance having
//! debited the user: it hands the message to the carrier and, if the
//! carrier refuses, marks the SMS failed and asks finance for a refund.
//! Events that must leave the process are written to the outbox in the
//! same unit of work as the status change, so a failed publish is retried
//! by the [`OutboxRelay`](crate::OutboxRelay) instead of being lost.

use std::time::Instant;

use common::{SmsId, TransactionId};
use domain::{MNO_PROVIDER_FAILED, SmsBillingCompleted, SmsEvent, SmsMessage, SmsStatus};
use messaging::EventPublisher;
use storage::{OutboxEntry, SmsFilter, SmsRepositoryExt, SmsStore, StorageError};
use uuid::Uuid;

use crate::error::{Result, SagaError};
use crate::provider::{DeliveryProvider, ProviderError};

/// Saga settings.
#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// Units debited per SMS.
    pub billing_amount: i64,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self { billing_amount: 1 }
    }
}

/// How a new SMS was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Persisted and the billing request reached the broker.
    Billed,
    /// Persisted, but the billing request is waiting in the outbox for the
    /// relay.
    BillingDeferred,
}

/// How a billing completion was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The carrier accepted the message.
    Delivered,
    /// The carrier refused; the SMS failed and a refund was requested.
    Failed,
    /// The SMS had already left `Pending`; nothing was done.
    AlreadyProcessed,
}

/// Drives SMS records through the billing saga.
///
/// This is the only component that changes SMS status.
pub struct SmsSagaService<R, P, D> {
    store: R,
    publisher: P,
    provider: D,
    config: SagaConfig,
}

impl<R, P, D> SmsSagaService<R, P, D>
where
    R: SmsStore,
    P: EventPublisher,
    D: DeliveryProvider,
{
    /// Creates a new saga service with the default configuration.
    pub fn new(store: R, publisher: P, provider: D) -> Self {
        Self::with_config(store, publisher, provider, SagaConfig::default())
    }

    /// Creates a new saga service.
    pub fn with_config(store: R, publisher: P, provider: D, config: SagaConfig) -> Self {
        Self {
            store,
            publisher,
            provider,
            config,
        }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &R {
        &self.store
    }

    /// Persists a new SMS and requests billing for it.
    ///
    /// The SMS and its `BillingRequested` outbox entry are committed
    /// together; if that fails nothing is published and the error is
    /// returned. Once committed the SMS exists: a publish failure after
    /// commit yields [`CreateOutcome::BillingDeferred`] and the relay
    /// republishes the request.
    #[tracing::instrument(skip(self, sms), fields(sms_id = %sms.id(), user_id = %sms.user_id()))]
    pub async fn create_and_bill_sms(&self, sms: &SmsMessage) -> Result<CreateOutcome> {
        let event = SmsEvent::billing_requested(
            sms.user_id().clone(),
            sms.id(),
            self.config.billing_amount,
        );
        let entry = OutboxEntry::for_event(&event)?;
        let entry_id = entry.id;

        let mut tx = self.store.begin().await?;
        tx.create(sms).await?;
        tx.enqueue(entry).await?;
        if let Err(e) = tx.commit().await {
            tracing::error!(error = %e, "failed to persist SMS");
            return Err(e.into());
        }
        metrics::counter!("sms_created_total").increment(1);
        tracing::info!(receiver = sms.receiver(), "SMS created");

        if self.publish_outboxed(entry_id, &event).await.is_err() {
            metrics::counter!("sms_billing_requests_deferred_total").increment(1);
            return Ok(CreateOutcome::BillingDeferred);
        }
        metrics::counter!("sms_billing_requests_published_total").increment(1);
        tracing::info!("billing request published");
        Ok(CreateOutcome::Billed)
    }

    /// Handles finance's confirmation that an SMS was paid for.
    ///
    /// A missing SMS is an error so the caller can retry (the record may
    /// not be visible yet). An SMS no longer `Pending` is treated as a
    /// duplicate and skipped.
    #[tracing::instrument(
        skip(self, event),
        fields(sms_id = %event.sms_id, transaction_id = %event.transaction_id)
    )]
    pub async fn process_debited_sms(
        &self,
        event: &SmsBillingCompleted,
    ) -> Result<ProcessOutcome> {
        let sms = self
            .store
            .find_by_id(event.sms_id)
            .await
            .map_err(|e| SagaError::from_lookup(event.sms_id, e))?;

        if sms.status() != SmsStatus::Pending {
            return Ok(already_processed(sms.status()));
        }

        tracing::info!(receiver = sms.receiver(), "attempting SMS delivery");
        let started = Instant::now();
        let sent = self.provider.send(&sms).await;
        metrics::histogram!("sms_delivery_seconds").record(started.elapsed().as_secs_f64());

        match sent {
            Ok(provider) => self.record_delivery(sms, provider).await,
            Err(e) => self.refund(sms, e, &event.transaction_id).await,
        }
    }

    /// Loads an SMS by id.
    pub async fn get_sms(&self, id: SmsId) -> Result<SmsMessage> {
        self.store
            .find_by_id(id)
            .await
            .map_err(|e| SagaError::from_lookup(id, e))
    }

    /// Loads the oldest SMS matching `filter`.
    pub async fn find_sms(&self, filter: SmsFilter) -> Result<SmsMessage> {
        let id = filter.id;
        self.store.get_by_filter(filter).await.map_err(|e| match id {
            Some(id) => SagaError::from_lookup(id, e),
            None => SagaError::Persistence(e),
        })
    }

    async fn record_delivery(
        &self,
        mut sms: SmsMessage,
        provider: String,
    ) -> Result<ProcessOutcome> {
        sms.mark_delivered(provider)?;

        match self
            .store
            .update_if_status(sms.id(), SmsStatus::Pending, &sms)
            .await
        {
            Ok(()) => {
                metrics::counter!("sms_delivered_total").increment(1);
                tracing::info!(provider = sms.provider(), "SMS delivered");
                Ok(ProcessOutcome::Delivered)
            }
            Err(StorageError::Conflict { actual, .. }) => Ok(already_processed(actual)),
            Err(e) => {
                tracing::error!(error = %e, "failed to persist delivery");
                Err(SagaError::from_lookup(sms.id(), e))
            }
        }
    }

    async fn refund(
        &self,
        mut sms: SmsMessage,
        error: ProviderError,
        transaction_id: &TransactionId,
    ) -> Result<ProcessOutcome> {
        tracing::warn!(provider = %error.provider, reason = %error.reason, "SMS delivery failed");
        sms.mark_failed(error.provider, MNO_PROVIDER_FAILED)?;

        let event = SmsEvent::billing_refund(transaction_id.clone());
        let entry = OutboxEntry::for_event(&event)?;
        let entry_id = entry.id;

        // Failed status and refund request commit together.
        let mut tx = self.store.begin().await?;
        let staged = match tx
            .update_if_status(sms.id(), SmsStatus::Pending, &sms)
            .await
        {
            Ok(()) => tx.enqueue(entry).await,
            Err(e) => Err(e),
        };
        let committed = match staged {
            Ok(()) => tx.commit().await,
            Err(e) => Err(e),
        };
        match committed {
            Ok(()) => {}
            Err(StorageError::Conflict { actual, .. }) => return Ok(already_processed(actual)),
            Err(e) => {
                tracing::error!(error = %e, "failed to persist delivery failure");
                return Err(SagaError::from_lookup(sms.id(), e));
            }
        }
        metrics::counter!("sms_failed_total").increment(1);

        self.publish_outboxed(entry_id, &event).await?;
        metrics::counter!("sms_refunds_requested_total").increment(1);
        tracing::info!("refund requested");
        Ok(ProcessOutcome::Failed)
    }

    /// Publishes an event that is already in the outbox and settles the
    /// entry accordingly.
    async fn publish_outboxed(&self, entry_id: Uuid, event: &SmsEvent) -> Result<()> {
        match self.publisher.publish_event(event).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_dispatched(entry_id).await {
                    // The relay republishes it; consumers dedupe.
                    tracing::warn!(%entry_id, error = %e, "failed to mark outbox entry dispatched");
                }
                Ok(())
            }
            Err(e) => {
                tracing::error!(%entry_id, error = %e, "publish failed, left for outbox relay");
                if let Err(record) = self.store.record_failure(entry_id, &e.to_string()).await {
                    tracing::warn!(%entry_id, error = %record, "failed to record publish failure");
                }
                Err(e.into())
            }
        }
    }
}

fn already_processed(status: SmsStatus) -> ProcessOutcome {
    metrics::counter!("sms_already_processed_total").increment(1);
    tracing::info!(%status, "SMS already processed, skipping");
    ProcessOutcome::AlreadyProcessed
}
