//! Outbox relay.
//!
//! Republishes outbox entries that were committed but never confirmed by
//! the broker. Untried entries younger than `min_age` are left to the saga,
//! which publishes them right after commit. Delivery is still at-least-once:
//! an entry the saga published but failed to mark dispatched goes out again.

use std::time::Duration;

use messaging::EventPublisher;
use storage::{OutboxEntry, OutboxStore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Pause between sweeps.
    pub poll_interval: Duration,
    /// Entries fetched per sweep.
    pub batch_size: usize,
    /// How long an entry with no failed attempts is left alone.
    pub min_age: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            min_age: Duration::from_secs(5),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub published: usize,
    pub failed: usize,
}

impl RelayReport {
    /// Returns true if the sweep found nothing to do.
    pub fn is_empty(&self) -> bool {
        self.published == 0 && self.failed == 0
    }
}

/// Publishes undispatched outbox entries.
pub struct OutboxRelay<S, P> {
    store: S,
    publisher: P,
    config: RelayConfig,
}

impl<S, P> OutboxRelay<S, P>
where
    S: OutboxStore,
    P: EventPublisher,
{
    /// Creates a relay with the default configuration.
    pub fn new(store: S, publisher: P) -> Self {
        Self::with_config(store, publisher, RelayConfig::default())
    }

    /// Creates a relay.
    pub fn with_config(store: S, publisher: P, config: RelayConfig) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    /// Publishes one batch of pending entries, oldest first.
    ///
    /// A failing entry is recorded and skipped; only store errors abort
    /// the sweep.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) -> Result<RelayReport> {
        let entries = self.store.pending_outbox(self.config.batch_size).await?;
        let mut report = RelayReport::default();

        for entry in entries.into_iter().filter(|e| self.is_due(e)) {
            match self.relay(&entry).await {
                Ok(()) => {
                    self.store.mark_dispatched(entry.id).await?;
                    metrics::counter!("outbox_relayed_total", "event_type" => entry.event_type.clone())
                        .increment(1);
                    report.published += 1;
                }
                Err(reason) => {
                    tracing::warn!(
                        entry_id = %entry.id,
                        event_type = %entry.event_type,
                        attempts = entry.attempts + 1,
                        error = %reason,
                        "outbox relay failed"
                    );
                    self.store.record_failure(entry.id, &reason).await?;
                    metrics::counter!("outbox_relay_failures_total", "event_type" => entry.event_type.clone())
                        .increment(1);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    fn is_due(&self, entry: &OutboxEntry) -> bool {
        entry.attempts > 0 || entry.age() >= self.config.min_age
    }

    async fn relay(&self, entry: &OutboxEntry) -> std::result::Result<(), String> {
        let event = entry.event().map_err(|e| e.to_string())?;
        self.publisher
            .publish_event(&event)
            .await
            .map_err(|e| e.to_string())
    }

    /// Sweeps every `poll_interval` until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let period = self.config.poll_interval.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            ?period,
            batch_size = self.config.batch_size,
            min_age = ?self.config.min_age,
            "outbox relay started"
        );
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.run_once().await {
                Ok(report) if !report.is_empty() => {
                    tracing::info!(published = report.published, failed = report.failed, "outbox sweep");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "outbox sweep failed"),
            }
        }
        tracing::info!("outbox relay stopped");
    }
}
