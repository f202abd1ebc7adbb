//! SMS dispatcher entry point.

use std::sync::Arc;

use api::config::{Config, LogFormat};
use api::{SharedPublisher, SharedStore};
use messaging::{BrokerEventPublisher, InMemoryBroker, ReliableConsumer};
use saga::{BillingCompletedHandler, OutboxRelay};
use sqlx::postgres::PgPoolOptions;
use storage::{InMemorySmsRepository, PostgresSmsRepository};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

async fn open_store(config: &Config) -> SharedStore {
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .expect("failed to connect to PostgreSQL");
            let repo = PostgresSmsRepository::new(pool);
            repo.run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL store");
            Arc::new(repo)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store");
            Arc::new(InMemorySmsRepository::new())
        }
    }
}

#[tokio::main]
async fn main() {
    // 1. Load configuration and initialize tracing
    let config = Config::from_env();
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Storage, broker topology, and the saga
    let store = open_store(&config).await;
    let broker = InMemoryBroker::new();
    api::declare_topology(&broker, &config);

    let publisher = BrokerEventPublisher::with_config(broker.clone(), config.publisher_config());
    tracing::info!(
        confirms = publisher.confirms_enabled(),
        confirm_timeout = ?config.publish_confirm_timeout,
        "event publisher ready"
    );
    let publisher: SharedPublisher = Arc::new(publisher);
    let provider = api::build_provider(&config);
    let state = api::create_state(
        store.clone(),
        publisher.clone(),
        provider,
        config.saga_config(),
    );

    // 4. Start the billing-completed consumer and the outbox relay
    let shutdown = CancellationToken::new();
    let consumer = ReliableConsumer::new(broker.clone(), config.retry_policy())
        .with_confirm_timeout(config.publish_confirm_timeout);
    let subscription = consumer
        .subscribe(
            &config.billing_completed_queue,
            config.subscribe_options(),
            BillingCompletedHandler::new(state.saga.clone()),
            shutdown.clone(),
        )
        .await
        .expect("failed to subscribe to billing-completed queue");

    let relay = OutboxRelay::with_config(store, publisher, config.relay_config());
    let relay_task = tokio::spawn(relay.run(shutdown.clone()));

    // 5. Serve HTTP until a shutdown signal arrives
    let app = api::create_app(state, metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, "starting SMS dispatcher");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 6. Drain the consumer, then stop background tasks
    let outcome = subscription.shutdown(config.drain_timeout).await;
    tracing::info!(?outcome, "consumer stopped");
    shutdown.cancel();
    if let Err(e) = relay_task.await {
        tracing::error!(error = %e, "outbox relay task failed");
    }
    broker.close();

    tracing::info!("server shut down gracefully");
}
