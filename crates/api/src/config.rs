//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use messaging::{PublisherConfig, RetryPolicy, SubscribeOptions};
use saga::{RelayConfig, SagaConfig};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Which simulated carrier delivers messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Always succeeds.
    Mock,
    /// Fails with `PROVIDER_FAIL_PROBABILITY`.
    Random,
    /// Always fails.
    Fail,
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mock" => Ok(ProviderKind::Mock),
            "random" => Ok(ProviderKind::Random),
            "fail" => Ok(ProviderKind::Fail),
            other => Err(format!("unknown SMS provider: {other}")),
        }
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables (and a `.env` file, if present):
/// - `HOST` / `PORT`: bind address (default: `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `pretty` or `json` (default: `pretty`)
/// - `DATABASE_URL`: PostgreSQL URL; unset means the in-memory store
/// - `BILLING_COMPLETED_QUEUE` / `BILLING_COMPLETED_ROUTING_KEY`
/// - `PREFETCH_COUNT`, `RETRY_MAX_ATTEMPTS`, `RETRY_BASE_DELAY_MS`,
///   `RETRY_MAX_DELAY_MS`: consumption pipeline
/// - `PUBLISH_CONFIRM_TIMEOUT_MS`, `DRAIN_TIMEOUT_MS`
/// - `OUTBOX_POLL_INTERVAL_MS`, `OUTBOX_BATCH_SIZE`, `OUTBOX_MIN_AGE_MS`
/// - `SMS_PROVIDER` (`mock`, `random`, `fail`), `PROVIDER_FAIL_PROBABILITY`
/// - `BILLING_AMOUNT`
///
/// Missing or unparsable values fall back to their defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub billing_completed_queue: String,
    pub billing_completed_routing_key: String,
    pub prefetch_count: u16,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub publish_confirm_timeout: Duration,
    /// `Duration::ZERO` stops the consumer without draining.
    pub drain_timeout: Duration,
    pub outbox_poll_interval: Duration,
    pub outbox_batch_size: usize,
    pub outbox_min_age: Duration,
    pub sms_provider: ProviderKind,
    pub provider_fail_probability: f64,
    pub billing_amount: i64,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: env_or("PORT", defaults.port),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: env_or("LOG_FORMAT", defaults.log_format),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            billing_completed_queue: std::env::var("BILLING_COMPLETED_QUEUE")
                .unwrap_or(defaults.billing_completed_queue),
            billing_completed_routing_key: std::env::var("BILLING_COMPLETED_ROUTING_KEY")
                .unwrap_or(defaults.billing_completed_routing_key),
            prefetch_count: env_or("PREFETCH_COUNT", defaults.prefetch_count),
            retry_max_attempts: env_or("RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts),
            retry_base_delay: env_millis("RETRY_BASE_DELAY_MS", defaults.retry_base_delay),
            retry_max_delay: env_millis("RETRY_MAX_DELAY_MS", defaults.retry_max_delay),
            publish_confirm_timeout: env_millis(
                "PUBLISH_CONFIRM_TIMEOUT_MS",
                defaults.publish_confirm_timeout,
            ),
            drain_timeout: env_millis("DRAIN_TIMEOUT_MS", defaults.drain_timeout),
            outbox_poll_interval: env_millis(
                "OUTBOX_POLL_INTERVAL_MS",
                defaults.outbox_poll_interval,
            ),
            outbox_batch_size: env_or("OUTBOX_BATCH_SIZE", defaults.outbox_batch_size),
            outbox_min_age: env_millis("OUTBOX_MIN_AGE_MS", defaults.outbox_min_age),
            sms_provider: env_or("SMS_PROVIDER", defaults.sms_provider),
            provider_fail_probability: env_or(
                "PROVIDER_FAIL_PROBABILITY",
                defaults.provider_fail_probability,
            ),
            billing_amount: env_or("BILLING_AMOUNT", defaults.billing_amount),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns the dead-letter queue of the billing-completed queue.
    pub fn billing_completed_dlq(&self) -> String {
        format!("{}.dlq", self.billing_completed_queue)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
        }
    }

    pub fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions {
            prefetch: self.prefetch_count,
            consumer_tag: "sms-dispatcher".to_string(),
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            confirm_timeout: self.publish_confirm_timeout,
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            poll_interval: self.outbox_poll_interval,
            batch_size: self.outbox_batch_size,
            min_age: self.outbox_min_age,
        }
    }

    pub fn saga_config(&self) -> SagaConfig {
        SagaConfig {
            billing_amount: self.billing_amount,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            database_url: None,
            billing_completed_queue: "sms.billing.completed".to_string(),
            billing_completed_routing_key: "finance.billing.completed".to_string(),
            prefetch_count: 1,
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
            publish_confirm_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
            outbox_poll_interval: Duration::from_secs(1),
            outbox_batch_size: 100,
            outbox_min_age: Duration::from_secs(5),
            sms_provider: ProviderKind::Mock,
            provider_fail_probability: 0.25,
            billing_amount: 1,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
