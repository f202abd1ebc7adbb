//! HTTP adapter and process wiring for the SMS dispatcher.
//!
//! Provides the REST endpoints that accept and look up SMS messages, and
//! the helpers the `sms-dispatcher` binary uses to assemble the saga, the
//! broker topology, and the delivery provider.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use messaging::{EventPublisher, InMemoryBroker, TOPIC_EXCHANGE};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{DeliveryProvider, SagaConfig, SimulatedProvider, SmsSagaService};
use storage::SmsStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::{Config, ProviderKind};

/// Store shared by the HTTP layer, the consumer, and the outbox relay.
pub type SharedStore = Arc<dyn SmsStore>;

/// Publisher shared by the saga and the outbox relay.
pub type SharedPublisher = Arc<dyn EventPublisher>;

pub type SharedProvider = Arc<dyn DeliveryProvider>;

/// The saga service as wired in this process.
pub type AppSagaService = SmsSagaService<SharedStore, SharedPublisher, SharedProvider>;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub saga: Arc<AppSagaService>,
}

/// Creates the application state around a saga service.
pub fn create_state(
    store: SharedStore,
    publisher: SharedPublisher,
    provider: SharedProvider,
    config: SagaConfig,
) -> Arc<AppState> {
    let saga = SmsSagaService::with_config(store, publisher, provider, config);
    Arc::new(AppState {
        saga: Arc::new(saga),
    })
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::render))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/sms", post(routes::sms::send))
        .route("/sms/{id}", get(routes::sms::get))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Builds the simulated carrier selected by `SMS_PROVIDER`.
pub fn build_provider(config: &Config) -> SharedProvider {
    let provider = match config.sms_provider {
        ProviderKind::Mock => SimulatedProvider::always_succeed(),
        ProviderKind::Random => {
            SimulatedProvider::random_fail(config.provider_fail_probability, None)
        }
        ProviderKind::Fail => SimulatedProvider::always_fail(),
    };
    Arc::new(provider.with_latency(Duration::from_millis(100)))
}

/// Declares the queues this process consumes from.
///
/// The billing-completed queue is bound on the topic exchange under the
/// finance routing key; its dead-letter queue is reached through the
/// default exchange.
pub fn declare_topology(broker: &InMemoryBroker, config: &Config) {
    broker.bind_queue(
        &config.billing_completed_queue,
        TOPIC_EXCHANGE,
        &config.billing_completed_routing_key,
    );
    broker.declare_queue(&config.billing_completed_dlq());
}
