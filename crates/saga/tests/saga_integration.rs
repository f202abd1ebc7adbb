//! Integration tests for the SMS billing saga.

use std::sync::Arc;
use std::time::Duration;

use common::{SmsId, TransactionId, UserId};
use domain::{SmsBillingCompleted, SmsMessage, SmsStatus};
use messaging::{
    BILLING_REFUNDED_ROUTING_KEY, BILLING_REQUESTED_ROUTING_KEY, BrokerEventPublisher,
    InMemoryBroker, OutboundMessage, ReliableConsumer, RetryPolicy, SubscribeOptions,
    TOPIC_EXCHANGE, Transport,
};
use saga::{
    BillingCompletedHandler, CreateOutcome, OutboxRelay, ProcessOutcome, SagaError, SimulatedProvider,
    SmsSagaService,
};
use serde_json::Value;
use storage::{InMemorySmsRepository, OutboxStore, SmsRepositoryExt};
use tokio_util::sync::CancellationToken;

type TestService =
    SmsSagaService<InMemorySmsRepository, BrokerEventPublisher<InMemoryBroker>, Arc<SimulatedProvider>>;

struct TestHarness {
    service: Arc<TestService>,
    store: InMemorySmsRepository,
    broker: InMemoryBroker,
    provider: Arc<SimulatedProvider>,
}

impl TestHarness {
    fn new(provider: SimulatedProvider) -> Self {
        let store = InMemorySmsRepository::new();
        let broker = InMemoryBroker::new();
        let provider = Arc::new(provider);
        let service = SmsSagaService::new(
            store.clone(),
            BrokerEventPublisher::new(broker.clone()),
            provider.clone(),
        );

        Self {
            service: Arc::new(service),
            store,
            broker,
            provider,
        }
    }

    async fn send(&self) -> SmsMessage {
        let sms = SmsMessage::new(UserId::new("1"), "+1234567890", "hi").unwrap();
        let outcome = self.service.create_and_bill_sms(&sms).await.unwrap();
        assert_eq!(outcome, CreateOutcome::Billed);
        sms
    }

    fn refunds(&self) -> Vec<Value> {
        wire_payloads(&self.broker, BILLING_REFUNDED_ROUTING_KEY)
    }
}

fn wire_payloads(broker: &InMemoryBroker, routing_key: &str) -> Vec<Value> {
    broker
        .published_to(routing_key)
        .iter()
        .map(|m| serde_json::from_slice(&m.body).unwrap())
        .collect()
}

fn billing_completed(sms_id: SmsId, transaction_id: &str) -> SmsBillingCompleted {
    SmsBillingCompleted {
        user_id: UserId::new("1"),
        sms_id,
        amount: 1,
        transaction_id: TransactionId::new(transaction_id),
        timestamp: chrono::Utc::now(),
    }
}

mod create_and_bill {
    use super::*;

    #[tokio::test]
    async fn test_persists_pending_and_requests_billing() {
        let h = TestHarness::new(SimulatedProvider::always_succeed());
        let sms = h.send().await;

        let stored = h.store.find_by_id(sms.id()).await.unwrap();
        assert_eq!(stored.status(), SmsStatus::Pending);
        assert_eq!(stored.content(), "hi");
        assert_eq!(stored.receiver(), "+1234567890");

        let requests = wire_payloads(&h.broker, BILLING_REQUESTED_ROUTING_KEY);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["UserID"], "1");
        assert_eq!(requests[0]["Amount"], 1);
        assert_eq!(requests[0]["SMSID"], sms.id().to_string());
        assert_eq!(h.broker.published()[0].exchange, TOPIC_EXCHANGE);

        let outbox = h.store.outbox().await;
        assert_eq!(outbox.len(), 1);
        assert!(outbox[0].is_dispatched());
    }

    #[tokio::test]
    async fn test_persistence_failure_publishes_nothing() {
        let h = TestHarness::new(SimulatedProvider::always_succeed());
        h.store.set_fail_on_create(true);
        let sms = SmsMessage::new(UserId::new("1"), "+1234567890", "hi").unwrap();

        let err = h.service.create_and_bill_sms(&sms).await.unwrap_err();

        assert!(matches!(err, SagaError::Persistence(_)));
        assert!(h.broker.published().is_empty());
        assert_eq!(h.store.message_count().await, 0);
        assert!(h.store.outbox().await.is_empty());
    }

    #[tokio::test]
    async fn test_commit_failure_publishes_nothing() {
        let h = TestHarness::new(SimulatedProvider::always_succeed());
        h.store.set_fail_on_commit(true);
        let sms = SmsMessage::new(UserId::new("1"), "+1234567890", "hi").unwrap();

        let err = h.service.create_and_bill_sms(&sms).await.unwrap_err();

        assert!(matches!(err, SagaError::Persistence(_)));
        assert!(h.broker.published().is_empty());
        assert_eq!(h.store.message_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_sms_is_rejected() {
        let h = TestHarness::new(SimulatedProvider::always_succeed());
        let sms = h.send().await;

        let err = h.service.create_and_bill_sms(&sms).await.unwrap_err();
        assert!(matches!(err, SagaError::Persistence(_)));
        assert_eq!(h.broker.published_to(BILLING_REQUESTED_ROUTING_KEY).len(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_request_in_outbox() {
        let h = TestHarness::new(SimulatedProvider::always_succeed());
        h.broker.fail_publishes_to(BILLING_REQUESTED_ROUTING_KEY);
        let sms = SmsMessage::new(UserId::new("1"), "+1234567890", "hi").unwrap();

        let outcome = h.service.create_and_bill_sms(&sms).await.unwrap();
        assert_eq!(outcome, CreateOutcome::BillingDeferred);
        assert_eq!(h.store.message_count().await, 1);

        let stored = h.store.find_by_id(sms.id()).await.unwrap();
        assert_eq!(stored.status(), SmsStatus::Pending);
        let pending = h.store.pending_outbox(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);

        h.broker.clear_publish_failures();
        let relay = OutboxRelay::new(h.store.clone(), BrokerEventPublisher::new(h.broker.clone()));
        assert_eq!(relay.run_once().await.unwrap().published, 1);

        let requests = wire_payloads(&h.broker, BILLING_REQUESTED_ROUTING_KEY);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["SMSID"], sms.id().to_string());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_keep_their_own_state() {
        let h = TestHarness::new(SimulatedProvider::always_succeed());

        let mut tasks = Vec::new();
        for n in 0..50 {
            let service = h.service.clone();
            tasks.push(tokio::spawn(async move {
                let sms = SmsMessage::new(
                    UserId::new(format!("user-{n}")),
                    format!("+1555000{n:04}"),
                    format!("message {n}"),
                )
                .unwrap();
                service.create_and_bill_sms(&sms).await.unwrap();
                (sms.id(), n)
            }));
        }

        for task in tasks {
            let (id, n) = task.await.unwrap();
            let stored = h.store.find_by_id(id).await.unwrap();
            assert_eq!(stored.user_id().as_str(), format!("user-{n}"));
            assert_eq!(stored.receiver(), format!("+1555000{n:04}"));
            assert_eq!(stored.content(), format!("message {n}"));
            assert_eq!(stored.status(), SmsStatus::Pending);
        }
        assert_eq!(h.store.message_count().await, 50);
        assert_eq!(h.broker.published_to(BILLING_REQUESTED_ROUTING_KEY).len(), 50);
    }
}

mod process_debited {
    use super::*;

    #[tokio::test]
    async fn test_successful_delivery() {
        let h = TestHarness::new(SimulatedProvider::always_succeed());
        let sms = h.send().await;

        let outcome = h
            .service
            .process_debited_sms(&billing_completed(sms.id(), "txn-1"))
            .await
            .unwrap();

        assert_eq!(outcome, ProcessOutcome::Delivered);
        let stored = h.store.find_by_id(sms.id()).await.unwrap();
        assert_eq!(stored.status(), SmsStatus::Delivered);
        assert_eq!(stored.provider(), Some("MockProvider"));
        assert!(stored.delivered_at().is_some());
        assert!(stored.failure_code().is_none());
        assert!(h.refunds().is_empty());
    }

    #[tokio::test]
    async fn test_failed_delivery_requests_one_refund() {
        let h = TestHarness::new(SimulatedProvider::always_fail());
        let sms = h.send().await;

        let outcome = h
            .service
            .process_debited_sms(&billing_completed(sms.id(), "txn-1"))
            .await
            .unwrap();

        assert_eq!(outcome, ProcessOutcome::Failed);
        let stored = h.store.find_by_id(sms.id()).await.unwrap();
        assert_eq!(stored.status(), SmsStatus::Failed);
        assert_eq!(stored.failure_code(), Some("MNOProviderFailed"));
        assert_eq!(stored.provider(), Some("AlwaysFailProvider"));
        assert!(stored.delivered_at().is_none());

        let refunds = h.refunds();
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0]["TransactionID"], "txn-1");
        assert!(h.store.pending_outbox(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_redelivered_completion_is_a_noop() {
        let h = TestHarness::new(SimulatedProvider::always_fail());
        let sms = h.send().await;
        let event = billing_completed(sms.id(), "txn-1");

        h.service.process_debited_sms(&event).await.unwrap();
        let again = h.service.process_debited_sms(&event).await.unwrap();

        assert_eq!(again, ProcessOutcome::AlreadyProcessed);
        assert_eq!(h.provider.calls(), 1);
        assert_eq!(h.refunds().len(), 1);
    }

    #[tokio::test]
    async fn test_refund_publish_failure_persists_failure_first() {
        let h = TestHarness::new(SimulatedProvider::always_fail());
        let sms = h.send().await;
        h.broker.fail_publishes_to(BILLING_REFUNDED_ROUTING_KEY);
        let event = billing_completed(sms.id(), "txn-1");

        let err = h.service.process_debited_sms(&event).await.unwrap_err();
        assert!(matches!(err, SagaError::Publish(_)));

        let stored = h.store.find_by_id(sms.id()).await.unwrap();
        assert_eq!(stored.status(), SmsStatus::Failed);

        // A redelivery does not re-attempt delivery.
        let again = h.service.process_debited_sms(&event).await.unwrap();
        assert_eq!(again, ProcessOutcome::AlreadyProcessed);
        assert_eq!(h.provider.calls(), 1);

        // The refund goes out through the relay.
        h.broker.clear_publish_failures();
        let relay = OutboxRelay::new(h.store.clone(), BrokerEventPublisher::new(h.broker.clone()));
        relay.run_once().await.unwrap();
        let refunds = h.refunds();
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0]["TransactionID"], "txn-1");
    }

    #[tokio::test]
    async fn test_update_failure_surfaces_and_keeps_pending() {
        let h = TestHarness::new(SimulatedProvider::always_succeed());
        let sms = h.send().await;
        h.store.set_fail_on_update(true);

        let err = h
            .service
            .process_debited_sms(&billing_completed(sms.id(), "txn-1"))
            .await
            .unwrap_err();

        assert!(matches!(err, SagaError::Persistence(_)));
        let stored = h.store.find_by_id(sms.id()).await.unwrap();
        assert_eq!(stored.status(), SmsStatus::Pending);
    }

    #[tokio::test]
    async fn test_failed_refund_commit_publishes_nothing() {
        let h = TestHarness::new(SimulatedProvider::always_fail());
        let sms = h.send().await;
        h.store.set_fail_on_commit(true);

        let err = h
            .service
            .process_debited_sms(&billing_completed(sms.id(), "txn-1"))
            .await
            .unwrap_err();

        assert!(matches!(err, SagaError::Persistence(_)));
        assert!(h.refunds().is_empty());
        let stored = h.store.find_by_id(sms.id()).await.unwrap();
        assert_eq!(stored.status(), SmsStatus::Pending);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_persist_once() {
        let h = TestHarness::new(
            SimulatedProvider::always_succeed().with_latency(Duration::from_millis(10)),
        );
        let sms = h.send().await;
        let event = billing_completed(sms.id(), "txn-1");

        let (a, b) = tokio::join!(
            h.service.process_debited_sms(&event),
            h.service.process_debited_sms(&event)
        );
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| *o == ProcessOutcome::AlreadyProcessed);

        assert_eq!(
            outcomes,
            vec![ProcessOutcome::Delivered, ProcessOutcome::AlreadyProcessed]
        );
        let stored = h.store.find_by_id(sms.id()).await.unwrap();
        assert_eq!(stored.status(), SmsStatus::Delivered);
        // Both read Pending before either wrote, so the carrier saw the
        // message twice; only the stored outcome is deduplicated.
        assert_eq!(h.provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_every_nth_carrier_failure() {
        let h = TestHarness::new(SimulatedProvider::new(
            "FlakyCarrier",
            saga::FailureStrategy::every_nth(2),
        ));

        let mut statuses = Vec::new();
        for n in 0..4 {
            let sms = h.send().await;
            h.service
                .process_debited_sms(&billing_completed(sms.id(), &format!("txn-{n}")))
                .await
                .unwrap();
            statuses.push(h.store.find_by_id(sms.id()).await.unwrap().status());
        }

        assert_eq!(
            statuses,
            vec![
                SmsStatus::Delivered,
                SmsStatus::Failed,
                SmsStatus::Delivered,
                SmsStatus::Failed
            ]
        );
        let refunds = h.refunds();
        assert_eq!(refunds.len(), 2);
        assert_eq!(refunds[0]["TransactionID"], "txn-1");
        assert_eq!(refunds[1]["TransactionID"], "txn-3");
    }
}

mod end_to_end {
    use super::*;

    const QUEUE: &str = "sms.billing.completed";
    const COMPLETED_KEY: &str = "finance.billing.completed";

    fn topology(broker: &InMemoryBroker) {
        broker.bind_queue(QUEUE, TOPIC_EXCHANGE, COMPLETED_KEY);
        broker.declare_queue(&format!("{QUEUE}.dlq"));
    }

    async fn finance_completes(broker: &InMemoryBroker, sms_id: SmsId, transaction_id: &str) {
        let body = serde_json::to_vec(&billing_completed(sms_id, transaction_id)).unwrap();
        broker
            .publish(OutboundMessage::new(TOPIC_EXCHANGE, COMPLETED_KEY, body))
            .await
            .unwrap();
    }

    async fn wait_for_status(store: &InMemorySmsRepository, id: SmsId, status: SmsStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if store.find_by_id(id).await.unwrap().status() == status {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("status not reached in time");
    }

    fn fast_retries() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_billing_completion_through_the_pipeline() {
        let h = TestHarness::new(SimulatedProvider::always_fail());
        topology(&h.broker);
        let consumer = ReliableConsumer::new(h.broker.clone(), fast_retries());
        let subscription = consumer
            .subscribe(
                QUEUE,
                SubscribeOptions::default(),
                BillingCompletedHandler::new(h.service.clone()),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let sms = h.send().await;
        finance_completes(&h.broker, sms.id(), "txn-1").await;
        wait_for_status(&h.store, sms.id(), SmsStatus::Failed).await;

        // Redelivery of the same completion is absorbed by the status guard.
        finance_completes(&h.broker, sms.id(), "txn-1").await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.broker.queue_depth(QUEUE) > 0 || h.broker.unacked_count(QUEUE) > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        subscription.shutdown(Duration::from_secs(1)).await;
        assert_eq!(h.provider.calls(), 1);
        assert_eq!(h.refunds().len(), 1);
        assert!(h.broker.take_ready(&format!("{QUEUE}.dlq")).is_empty());
    }

    #[tokio::test]
    async fn test_completion_for_unknown_sms_is_dead_lettered() {
        let h = TestHarness::new(SimulatedProvider::always_succeed());
        topology(&h.broker);
        let consumer = ReliableConsumer::new(h.broker.clone(), fast_retries());
        let subscription = consumer
            .subscribe(
                QUEUE,
                SubscribeOptions::default(),
                BillingCompletedHandler::new(h.service.clone()),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        finance_completes(&h.broker, SmsId::new(), "txn-9").await;

        let dlq = format!("{QUEUE}.dlq");
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.broker.queue_depth(&dlq) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        subscription.shutdown(Duration::from_secs(1)).await;
        let dead = h.broker.take_ready(&dlq);
        assert_eq!(dead[0].header("attempts"), Some("3"));
        assert!(dead[0].header("x-last-error").unwrap().starts_with("SMS not found"));
        assert_eq!(h.provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_relay_task_recovers_lost_billing_request() {
        let h = TestHarness::new(SimulatedProvider::always_succeed());
        h.broker.fail_publishes_to(BILLING_REQUESTED_ROUTING_KEY);
        let sms = SmsMessage::new(UserId::new("1"), "+1234567890", "hi").unwrap();
        assert_eq!(
            h.service.create_and_bill_sms(&sms).await.unwrap(),
            CreateOutcome::BillingDeferred
        );

        let shutdown = CancellationToken::new();
        let relay = OutboxRelay::with_config(
            h.store.clone(),
            BrokerEventPublisher::new(h.broker.clone()),
            saga::RelayConfig {
                poll_interval: Duration::from_millis(10),
                batch_size: 10,
                ..Default::default()
            },
        );
        let task = tokio::spawn(relay.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        h.broker.clear_publish_failures();
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.broker.published_to(BILLING_REQUESTED_ROUTING_KEY).is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        task.await.unwrap();
        let outbox = h.store.outbox().await;
        assert!(outbox[0].is_dispatched());
        assert!(outbox[0].attempts >= 1);
    }
}
