//! Delivery provider trait and simulated carriers.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use domain::SmsMessage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

/// Name reported by the always-succeeding carrier.
pub const MOCK_PROVIDER: &str = "MockProvider";

/// Name reported by the probabilistically failing carrier.
pub const RANDOM_FAIL_PROVIDER: &str = "RandomFailProvider";

/// Name reported by the always-failing carrier.
pub const ALWAYS_FAIL_PROVIDER: &str = "AlwaysFailProvider";

/// A carrier refused or could not take the message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{provider} failed to deliver: {reason}")]
pub struct ProviderError {
    /// Carrier that was attempted.
    pub provider: String,
    pub reason: String,
}

/// Hands an SMS to a carrier.
#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    /// Attempts delivery and returns the carrier name on success.
    ///
    /// The error carries the carrier name as well, so a failed SMS records
    /// who was tried.
    async fn send(&self, sms: &SmsMessage) -> Result<String, ProviderError>;
}

#[async_trait]
impl<P: DeliveryProvider + ?Sized> DeliveryProvider for Arc<P> {
    async fn send(&self, sms: &SmsMessage) -> Result<String, ProviderError> {
        (**self).send(sms).await
    }
}

/// Decides whether a simulated delivery fails.
///
/// Every strategy keeps its own state; nothing is shared between
/// providers.
#[derive(Debug)]
pub enum FailureStrategy {
    Never,
    Always,
    /// Fails each call independently with the given probability.
    Probability {
        probability: f64,
        rng: Mutex<StdRng>,
    },
    /// Fails every `n`-th call (the `n`-th, `2n`-th, ...). `n == 0` never
    /// fails.
    EveryNth { n: u64, calls: AtomicU64 },
}

impl FailureStrategy {
    /// Fails with `probability`, clamped to `[0, 1]`.
    ///
    /// A seed makes the sequence reproducible.
    pub fn probability(probability: f64, seed: Option<u64>) -> Self {
        let probability = if probability.is_nan() {
            0.0
        } else {
            probability.clamp(0.0, 1.0)
        };
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        FailureStrategy::Probability {
            probability,
            rng: Mutex::new(rng),
        }
    }

    /// Fails every `n`-th call.
    pub fn every_nth(n: u64) -> Self {
        FailureStrategy::EveryNth {
            n,
            calls: AtomicU64::new(0),
        }
    }

    /// Draws the outcome of the next delivery.
    pub fn should_fail(&self) -> bool {
        match self {
            FailureStrategy::Never => false,
            FailureStrategy::Always => true,
            FailureStrategy::Probability { probability, rng } => rng
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .gen_bool(*probability),
            FailureStrategy::EveryNth { n, calls } => {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                *n != 0 && call % n == 0
            }
        }
    }
}

/// A carrier stand-in driven by a [`FailureStrategy`].
#[derive(Debug)]
pub struct SimulatedProvider {
    name: String,
    strategy: FailureStrategy,
    latency: Duration,
    calls: AtomicU64,
}

impl SimulatedProvider {
    /// Creates a provider with a custom name and strategy.
    pub fn new(name: impl Into<String>, strategy: FailureStrategy) -> Self {
        Self {
            name: name.into(),
            strategy,
            latency: Duration::ZERO,
            calls: AtomicU64::new(0),
        }
    }

    /// A carrier that accepts everything.
    pub fn always_succeed() -> Self {
        Self::new(MOCK_PROVIDER, FailureStrategy::Never)
    }

    /// A carrier that fails with `probability`.
    pub fn random_fail(probability: f64, seed: Option<u64>) -> Self {
        Self::new(
            RANDOM_FAIL_PROVIDER,
            FailureStrategy::probability(probability, seed),
        )
    }

    /// A carrier that rejects everything.
    pub fn always_fail() -> Self {
        Self::new(ALWAYS_FAIL_PROVIDER, FailureStrategy::Always)
    }

    /// Adds a simulated round-trip before each answer.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Returns the reported carrier name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns how many deliveries were attempted.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryProvider for SimulatedProvider {
    async fn send(&self, _sms: &SmsMessage) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.strategy.should_fail() {
            return Err(ProviderError {
                provider: self.name.clone(),
                reason: "delivery failure".to_string(),
            });
        }
        Ok(self.name.clone())
    }
}

/// Adapts an async closure into a [`DeliveryProvider`].
pub struct FnProvider<F>(F);

impl<F, Fut> FnProvider<F>
where
    F: Fn(SmsMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, ProviderError>> + Send,
{
    /// Wraps `f` as a provider.
    pub fn new(f: F) -> Self {
        FnProvider(f)
    }
}

#[async_trait]
impl<F, Fut> DeliveryProvider for FnProvider<F>
where
    F: Fn(SmsMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, ProviderError>> + Send,
{
    async fn send(&self, sms: &SmsMessage) -> Result<String, ProviderError> {
        (self.0)(sms.clone()).await
    }
}
