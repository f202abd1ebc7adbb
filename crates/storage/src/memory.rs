use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use common::SmsId;
use domain::{SmsMessage, SmsStatus};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    OutboxEntry, Result, SmsFilter, StorageError,
    repository::{OutboxStore, SmsRepository, SmsTransaction},
};

/// In-memory SMS store for tests and the default binary wiring.
///
/// Offers the same semantics as the PostgreSQL adapter, including guarded
/// updates and all-or-nothing transactions, plus switches to inject
/// failures.
#[derive(Clone, Default)]
pub struct InMemorySmsRepository {
    state: Arc<RwLock<State>>,
    faults: Arc<Faults>,
}

#[derive(Default)]
struct State {
    messages: Vec<SmsMessage>,
    outbox: Vec<OutboxEntry>,
}

#[derive(Default)]
struct Faults {
    fail_on_create: AtomicBool,
    fail_on_update: AtomicBool,
    fail_on_commit: AtomicBool,
}

impl InMemorySmsRepository {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every create (direct or transactional) fail.
    pub fn set_fail_on_create(&self, fail: bool) {
        self.faults.fail_on_create.store(fail, Ordering::SeqCst);
    }

    /// Makes every update (direct or transactional) fail.
    pub fn set_fail_on_update(&self, fail: bool) {
        self.faults.fail_on_update.store(fail, Ordering::SeqCst);
    }

    /// Makes every transaction commit fail.
    pub fn set_fail_on_commit(&self, fail: bool) {
        self.faults.fail_on_commit.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of stored messages.
    pub async fn message_count(&self) -> usize {
        self.state.read().await.messages.len()
    }

    /// Returns every stored message in insertion order.
    pub async fn messages(&self) -> Vec<SmsMessage> {
        self.state.read().await.messages.clone()
    }

    /// Returns every outbox entry, dispatched or not.
    pub async fn outbox(&self) -> Vec<OutboxEntry> {
        self.state.read().await.outbox.clone()
    }

    /// Clears all messages and outbox entries.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.messages.clear();
        state.outbox.clear();
    }

    fn check_fault(flag: &AtomicBool, operation: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!(
                "simulated {operation} failure"
            )));
        }
        Ok(())
    }
}

impl State {
    fn position(&self, id: SmsId) -> Option<usize> {
        self.messages.iter().position(|m| m.id() == id)
    }

    fn check_absent(&self, id: SmsId) -> Result<()> {
        if self.position(id).is_some() {
            return Err(StorageError::AlreadyExists(id));
        }
        Ok(())
    }

    fn check_status(&self, id: SmsId, expected: SmsStatus) -> Result<usize> {
        let index = self.position(id).ok_or(StorageError::NotFound)?;
        let actual = self.messages[index].status();
        if actual != expected {
            return Err(StorageError::Conflict {
                id,
                expected,
                actual,
            });
        }
        Ok(index)
    }

    fn replace(&mut self, index: usize, sms: &SmsMessage) {
        let mut stored = sms.clone();
        stored.touch(Utc::now());
        self.messages[index] = stored;
    }
}

#[async_trait]
impl SmsRepository for InMemorySmsRepository {
    async fn create(&self, sms: &SmsMessage) -> Result<()> {
        Self::check_fault(&self.faults.fail_on_create, "create")?;

        let mut state = self.state.write().await;
        state.check_absent(sms.id())?;
        state.messages.push(sms.clone());
        Ok(())
    }

    async fn update(&self, id: SmsId, sms: &SmsMessage) -> Result<()> {
        Self::check_fault(&self.faults.fail_on_update, "update")?;

        let mut state = self.state.write().await;
        let index = state.position(id).ok_or(StorageError::NotFound)?;
        state.replace(index, sms);
        Ok(())
    }

    async fn update_if_status(
        &self,
        id: SmsId,
        expected: SmsStatus,
        sms: &SmsMessage,
    ) -> Result<()> {
        Self::check_fault(&self.faults.fail_on_update, "update")?;

        let mut state = self.state.write().await;
        let index = state.check_status(id, expected)?;
        state.replace(index, sms);
        Ok(())
    }

    async fn get_by_filter(&self, filter: SmsFilter) -> Result<SmsMessage> {
        let state = self.state.read().await;
        state
            .messages
            .iter()
            .find(|m| filter.matches(m))
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn begin(&self) -> Result<Box<dyn SmsTransaction>> {
        Ok(Box::new(InMemoryTransaction {
            repo: self.clone(),
            staged: Vec::new(),
        }))
    }
}

#[async_trait]
impl OutboxStore for InMemorySmsRepository {
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let state = self.state.read().await;
        let mut pending: Vec<_> = state
            .outbox
            .iter()
            .filter(|e| !e.is_dispatched())
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_dispatched(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .outbox
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StorageError::OutboxEntryNotFound(id))?;
        entry.mark_dispatched(Utc::now());
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .outbox
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StorageError::OutboxEntryNotFound(id))?;
        entry.mark_failed(error);
        Ok(())
    }
}

enum Staged {
    Create(SmsMessage),
    Update {
        id: SmsId,
        expected: SmsStatus,
        sms: SmsMessage,
    },
    Enqueue(OutboxEntry),
}

/// Staged writes applied under one write lock on commit.
struct InMemoryTransaction {
    repo: InMemorySmsRepository,
    staged: Vec<Staged>,
}

#[async_trait]
impl SmsTransaction for InMemoryTransaction {
    async fn create(&mut self, sms: &SmsMessage) -> Result<()> {
        InMemorySmsRepository::check_fault(&self.repo.faults.fail_on_create, "create")?;
        self.repo.state.read().await.check_absent(sms.id())?;
        self.staged.push(Staged::Create(sms.clone()));
        Ok(())
    }

    async fn update_if_status(
        &mut self,
        id: SmsId,
        expected: SmsStatus,
        sms: &SmsMessage,
    ) -> Result<()> {
        InMemorySmsRepository::check_fault(&self.repo.faults.fail_on_update, "update")?;
        self.repo.state.read().await.check_status(id, expected)?;
        self.staged.push(Staged::Update {
            id,
            expected,
            sms: sms.clone(),
        });
        Ok(())
    }

    async fn enqueue(&mut self, entry: OutboxEntry) -> Result<()> {
        self.staged.push(Staged::Enqueue(entry));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let Self { repo, staged } = *self;
        InMemorySmsRepository::check_fault(&repo.faults.fail_on_commit, "commit")?;

        let mut state = repo.state.write().await;

        // Re-validate under the write lock; another writer may have won
        // since the write was staged.
        for op in &staged {
            match op {
                Staged::Create(sms) => state.check_absent(sms.id())?,
                Staged::Update { id, expected, .. } => {
                    state.check_status(*id, *expected)?;
                }
                Staged::Enqueue(_) => {}
            }
        }

        for op in staged {
            match op {
                Staged::Create(sms) => state.messages.push(sms),
                Staged::Update { id, sms, .. } => {
                    if let Some(index) = state.position(id) {
                        state.replace(index, &sms);
                    }
                }
                Staged::Enqueue(entry) => state.outbox.push(entry),
            }
        }
        Ok(())
    }
}
