use common::{TransactionId, UserId};
use criterion::{Criterion, criterion_group, criterion_main};
use domain::{SmsBillingCompleted, SmsMessage};
use messaging::{BrokerEventPublisher, InMemoryBroker};
use saga::{SimulatedProvider, SmsSagaService};
use storage::InMemorySmsRepository;

type BenchService =
    SmsSagaService<InMemorySmsRepository, BrokerEventPublisher<InMemoryBroker>, SimulatedProvider>;

fn service(provider: SimulatedProvider) -> BenchService {
    SmsSagaService::new(
        InMemorySmsRepository::new(),
        BrokerEventPublisher::new(InMemoryBroker::new()),
        provider,
    )
}

fn new_sms() -> SmsMessage {
    SmsMessage::new(UserId::new("1"), "+1234567890", "benchmark message").unwrap()
}

fn completed(sms: &SmsMessage) -> SmsBillingCompleted {
    SmsBillingCompleted {
        user_id: sms.user_id().clone(),
        sms_id: sms.id(),
        amount: 1,
        transaction_id: TransactionId::new("txn-bench"),
        timestamp: chrono::Utc::now(),
    }
}

fn bench_create_and_bill(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("saga/create_and_bill_sms", |b| {
        b.iter(|| {
            rt.block_on(async {
                let service = service(SimulatedProvider::always_succeed());
                service.create_and_bill_sms(&new_sms()).await.unwrap();
            });
        });
    });
}

fn bench_full_saga_delivered(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("saga/full_saga_delivered", |b| {
        b.iter(|| {
            rt.block_on(async {
                let service = service(SimulatedProvider::always_succeed());
                let sms = new_sms();
                service.create_and_bill_sms(&sms).await.unwrap();
                service.process_debited_sms(&completed(&sms)).await.unwrap();
            });
        });
    });
}

fn bench_full_saga_refunded(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("saga/full_saga_refunded", |b| {
        b.iter(|| {
            rt.block_on(async {
                let service = service(SimulatedProvider::always_fail());
                let sms = new_sms();
                service.create_and_bill_sms(&sms).await.unwrap();
                service.process_debited_sms(&completed(&sms)).await.unwrap();
            });
        });
    });
}

fn bench_already_processed(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let service = service(SimulatedProvider::always_succeed());
    let sms = new_sms();
    let event = completed(&sms);

    rt.block_on(async {
        service.create_and_bill_sms(&sms).await.unwrap();
        service.process_debited_sms(&event).await.unwrap();
    });

    c.bench_function("saga/redelivered_completion", |b| {
        b.iter(|| {
            rt.block_on(async {
                service.process_debited_sms(&event).await.unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_create_and_bill,
    bench_full_saga_delivered,
    bench_full_saga_refunded,
    bench_already_processed
);
criterion_main!(benches);
