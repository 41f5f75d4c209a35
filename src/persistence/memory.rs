use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::PersistenceBackend;
use crate::cores::BucketState;
use crate::ledger::ConsumptionRecord;
use crate::types::{TimestampMs, Tokens};
use crate::PersistenceError;

/// In-process backend.
///
/// Useful as a default checkpoint target and for tests: [`set_available`]
/// simulates an outage, during which every call fails with
/// [`PersistenceError::Unavailable`].
///
/// [`set_available`]: MemoryBackend::set_available
#[derive(Debug)]
pub struct MemoryBackend<M = ()> {
    state: RwLock<MemoryState<M>>,
    available: AtomicBool,
}

#[derive(Debug)]
struct MemoryState<M> {
    buckets: HashMap<String, BucketState>,
    ledger: Vec<ConsumptionRecord<M>>,
    debt: Option<Tokens>,
}

impl<M> Default for MemoryBackend<M> {
    fn default() -> Self {
        Self {
            state: RwLock::new(MemoryState {
                buckets: HashMap::new(),
                ledger: Vec::new(),
                debt: None,
            }),
            available: AtomicBool::new(true),
        }
    }
}

impl<M> MemoryBackend<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), PersistenceError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PersistenceError::Unavailable)
        }
    }
}

#[async_trait]
impl<M> PersistenceBackend<M> for MemoryBackend<M>
where
    M: Clone + Send + Sync + 'static,
{
    async fn save_bucket_state(&self, key: &str, state: BucketState) -> Result<(), PersistenceError> {
        self.ensure_available()?;
        self.state.write().await.buckets.insert(key.to_string(), state);
        Ok(())
    }

    async fn load_bucket_state(&self, key: &str) -> Result<Option<BucketState>, PersistenceError> {
        self.ensure_available()?;
        Ok(self.state.read().await.buckets.get(key).copied())
    }

    async fn save_ledger(&self, records: Vec<ConsumptionRecord<M>>) -> Result<(), PersistenceError> {
        self.ensure_available()?;
        self.state.write().await.ledger = records;
        Ok(())
    }

    async fn load_ledger(&self) -> Result<Vec<ConsumptionRecord<M>>, PersistenceError> {
        self.ensure_available()?;
        Ok(self.state.read().await.ledger.clone())
    }

    async fn append_record(&self, record: ConsumptionRecord<M>) -> Result<(), PersistenceError> {
        self.ensure_available()?;
        self.state.write().await.ledger.push(record);
        Ok(())
    }

    async fn prune_ledger(&self, cutoff_ms: TimestampMs) -> Result<usize, PersistenceError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let before = state.ledger.len();
        state.ledger.retain(|r| r.timestamp_ms > cutoff_ms);
        Ok(before - state.ledger.len())
    }

    async fn save_debt(&self, debt: Tokens) -> Result<(), PersistenceError> {
        self.ensure_available()?;
        self.state.write().await.debt = Some(debt);
        Ok(())
    }

    async fn load_debt(&self) -> Result<Tokens, PersistenceError> {
        self.ensure_available()?;
        Ok(self.state.read().await.debt.unwrap_or(-1.0))
    }

    async fn clear(&self) -> Result<(), PersistenceError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        state.buckets.clear();
        state.ledger.clear();
        state.debt = None;
        Ok(())
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}
