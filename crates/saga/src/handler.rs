//! Inbound `BillingCompleted` messages.

use std::sync::Arc;

use async_trait::async_trait;
use domain::SmsBillingCompleted;
use messaging::{EventPublisher, HandlerError, MessageHandler};
use storage::SmsStore;

use crate::error::SagaError;
use crate::provider::DeliveryProvider;
use crate::service::SmsSagaService;

/// Feeds billing completions from the broker into the saga.
///
/// Every saga error, including an undecodable body, is returned to the
/// consumption pipeline, which retries and eventually dead-letters.
pub struct BillingCompletedHandler<R, P, D> {
    service: Arc<SmsSagaService<R, P, D>>,
}

impl<R, P, D> BillingCompletedHandler<R, P, D> {
    pub fn new(service: Arc<SmsSagaService<R, P, D>>) -> Self {
        Self { service }
    }
}

impl<R, P, D> Clone for BillingCompletedHandler<R, P, D> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
        }
    }
}

#[async_trait]
impl<R, P, D> MessageHandler for BillingCompletedHandler<R, P, D>
where
    R: SmsStore + 'static,
    P: EventPublisher + 'static,
    D: DeliveryProvider + 'static,
{
    async fn handle(&self, body: &[u8]) -> Result<(), HandlerError> {
        let event: SmsBillingCompleted = serde_json::from_slice(body).map_err(SagaError::from)?;
        let outcome = self.service.process_debited_sms(&event).await?;
        tracing::debug!(sms_id = %event.sms_id, ?outcome, "billing completion handled");
        Ok(())
    }
}
