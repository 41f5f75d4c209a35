//! Best-effort checkpointing of engine state.
//!
//! The engine talks to persistence through a one-way channel: it sends
//! [`PersistenceCommand`]s to a background worker and never waits for them.
//! The worker applies them to a [`PersistenceBackend`] and logs whatever goes
//! wrong. A slow or broken backend therefore cannot delay or fail an
//! admission, but a crash can lose writes still sitting in the channel.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::cores::BucketState;
use crate::ledger::ConsumptionRecord;
use crate::types::{TimestampMs, Tokens};
use crate::PersistenceError;

pub mod memory;
pub use memory::MemoryBackend;

/// Key under which the requests bucket is stored.
pub const RATE_BUCKET_KEY: &str = "rate";
/// Key under which the consumed-units bucket is stored.
pub const VOLUME_BUCKET_KEY: &str = "volume";

/// Storage the persistence worker writes to.
///
/// If a backend is shared between engines it must serialise access itself.
#[async_trait]
pub trait PersistenceBackend<M>: Send + Sync {
    async fn save_bucket_state(&self, key: &str, state: BucketState) -> Result<(), PersistenceError>;

    async fn load_bucket_state(&self, key: &str) -> Result<Option<BucketState>, PersistenceError>;

    /// Replaces the stored ledger.
    async fn save_ledger(&self, records: Vec<ConsumptionRecord<M>>) -> Result<(), PersistenceError>;

    async fn load_ledger(&self) -> Result<Vec<ConsumptionRecord<M>>, PersistenceError>;

    async fn append_record(&self, record: ConsumptionRecord<M>) -> Result<(), PersistenceError>;

    /// Removes records with `timestamp_ms <= cutoff_ms` and returns how many went.
    async fn prune_ledger(&self, cutoff_ms: TimestampMs) -> Result<usize, PersistenceError>;

    async fn save_debt(&self, debt: Tokens) -> Result<(), PersistenceError>;

    /// Stored compensation debt. A negative value means nothing is stored.
    async fn load_debt(&self) -> Result<Tokens, PersistenceError>;

    async fn clear(&self) -> Result<(), PersistenceError>;

    async fn is_available(&self) -> bool;
}

/// A write requested by the engine.
#[derive(Debug)]
pub enum PersistenceCommand<M> {
    SaveBucket { key: &'static str, state: BucketState },
    AppendRecord(ConsumptionRecord<M>),
    SaveLedger(Vec<ConsumptionRecord<M>>),
    PruneLedger { cutoff_ms: TimestampMs },
    SaveDebt(Tokens),
    Clear,
}

/// What travels over the worker channel.
enum Message<M> {
    Write(PersistenceCommand<M>),
    /// Acknowledged once every earlier write has been handled.
    Flush(oneshot::Sender<()>),
}

/// Sending side of the persistence channel, held by the engine.
pub struct PersistenceHandle<M> {
    tx: mpsc::UnboundedSender<Message<M>>,
    backend: Arc<dyn PersistenceBackend<M>>,
}

impl<M> Clone for PersistenceHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<M> std::fmt::Debug for PersistenceHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<M: Send + 'static> PersistenceHandle<M> {
    /// Spawns the persistence worker on the current tokio runtime.
    ///
    /// The worker stops once every handle has been dropped.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn spawn(backend: Arc<dyn PersistenceBackend<M>>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(Arc::clone(&backend), rx));
        (Self { tx, backend }, worker)
    }

    /// Queues a write. Never blocks and never fails the caller.
    pub(crate) fn submit(&self, command: PersistenceCommand<M>) {
        if self.tx.send(Message::Write(command)).is_err() {
            debug!("persistence worker stopped, dropping write");
        }
    }

    /// Waits until the worker has handled every write queued before this call.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Message::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    pub fn backend(&self) -> &Arc<dyn PersistenceBackend<M>> {
        &self.backend
    }
}

async fn run_worker<M: Send + 'static>(
    backend: Arc<dyn PersistenceBackend<M>>,
    mut rx: mpsc::UnboundedReceiver<Message<M>>,
) {
    while let Some(message) = rx.recv().await {
        let command = match message {
            Message::Write(command) => command,
            Message::Flush(ack) => {
                let _ = ack.send(());
                continue;
            }
        };
        if !backend.is_available().await {
            debug!("persistence backend unavailable, skipping write");
            continue;
        }
        if let Err(e) = apply(backend.as_ref(), command).await {
            warn!("persistence write failed: {}", e);
        }
    }
    debug!("persistence worker finished");
}

async fn apply<M: Send + 'static>(
    backend: &dyn PersistenceBackend<M>,
    command: PersistenceCommand<M>,
) -> Result<(), PersistenceError> {
    match command {
        PersistenceCommand::SaveBucket { key, state } => backend.save_bucket_state(key, state).await,
        PersistenceCommand::AppendRecord(record) => backend.append_record(record).await,
        PersistenceCommand::SaveLedger(records) => backend.save_ledger(records).await,
        PersistenceCommand::PruneLedger { cutoff_ms } => {
            let removed = backend.prune_ledger(cutoff_ms).await?;
            if removed > 0 {
                debug!("pruned {} persisted record(s)", removed);
            }
            Ok(())
        }
        PersistenceCommand::SaveDebt(debt) => backend.save_debt(debt).await,
        PersistenceCommand::Clear => backend.clear().await,
    }
}

/// State read back from a backend by `initialize`. Missing or unreadable
/// parts are `None`/empty.
#[derive(Debug)]
pub(crate) struct RestoredState<M> {
    pub rate: Option<BucketState>,
    pub volume: Option<BucketState>,
    pub debt: Option<Tokens>,
    pub ledger: Vec<ConsumptionRecord<M>>,
}

impl<M: Send + 'static> RestoredState<M> {
    pub(crate) async fn load(backend: &dyn PersistenceBackend<M>) -> Self {
        let mut restored = RestoredState {
            rate: None,
            volume: None,
            debt: None,
            ledger: Vec::new(),
        };

        if !backend.is_available().await {
            debug!("persistence backend unavailable, starting from configuration");
            return restored;
        }

        restored.rate = swallow("rate bucket", backend.load_bucket_state(RATE_BUCKET_KEY).await).flatten();
        restored.volume =
            swallow("volume bucket", backend.load_bucket_state(VOLUME_BUCKET_KEY).await).flatten();
        restored.debt = swallow("compensation debt", backend.load_debt().await)
            .filter(|d| d.is_finite() && *d >= 0.0);
        restored.ledger = swallow("ledger", backend.load_ledger().await).unwrap_or_default();
        restored
    }
}

fn swallow<T>(what: &str, result: Result<T, PersistenceError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("failed to load persisted {}: {}", what, e);
            None
        }
    }
}
