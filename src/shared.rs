//! Engine shared between concurrent callers.
//!
//! Every read-modify-write runs inside [`Gate::run_exclusive`], so mutations
//! are applied one at a time in the order callers asked for them. Pure reads
//! skip the gate and only take the short engine lock.
//!
//! ```rust
//! use std::sync::Arc;
//! use rate_guard_throttle::clock::ManualClock;
//! use rate_guard_throttle::{SharedThrottle, ThrottleConfig, ThrottleEngine};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), rate_guard_throttle::ThrottleError> {
//! let clock = Arc::new(ManualClock::new(0));
//! let engine: ThrottleEngine = ThrottleEngine::with_clock(ThrottleConfig::new(60.0, 10_000.0), clock)?;
//! let throttle = Arc::new(SharedThrottle::new(engine));
//!
//! assert!(throttle.consume("req-1", 400.0, None).await?);
//! throttle.adjust_consumption("req-1", 350.0).await?;
//! assert_eq!(throttle.get_metrics().volume.used, 350.0);
//! # Ok(())
//! # }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::engine::{Admission, StateSnapshot, ThrottleEngine, ThrottleMetrics};
use crate::gate::Gate;
use crate::ledger::{ConsumptionRecord, LedgerStats};
use crate::persistence::RestoredState;
use crate::types::{TimestampMs, Tokens};
use crate::ThrottleResult;

#[derive(Debug)]
pub struct SharedThrottle<M = ()> {
    gate: Gate,
    engine: Mutex<ThrottleEngine<M>>,
}

impl<M: Clone + Send + 'static> SharedThrottle<M> {
    pub fn new(engine: ThrottleEngine<M>) -> Self {
        Self {
            gate: Gate::new(),
            engine: Mutex::new(engine),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ThrottleEngine<M>> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` on the engine without going through the gate.
    fn with_engine<T>(&self, f: impl FnOnce(&mut ThrottleEngine<M>) -> T) -> T {
        f(&mut self.lock())
    }

    /// Runs `f` on the engine in gate order.
    async fn exclusive<T>(&self, f: impl FnOnce(&mut ThrottleEngine<M>) -> T) -> ThrottleResult<T> {
        self.gate.run_exclusive(|| async { self.with_engine(f) }).await
    }

    /// Loads checkpointed state. The backend is read while holding the gate
    /// but not the engine lock, so reads stay available meanwhile.
    pub async fn initialize(&self) -> ThrottleResult<()> {
        self.gate
            .run_exclusive(|| async {
                let persistence = self.with_engine(|e| e.persistence().cloned());
                if let Some(persistence) = persistence {
                    let restored = RestoredState::load(persistence.backend().as_ref()).await;
                    self.with_engine(|e| e.apply_restored(restored));
                }
            })
            .await
    }

    pub fn can_process(&self, estimate: Tokens) -> ThrottleResult<Admission> {
        self.with_engine(|e| e.can_process(estimate))
    }

    pub fn time_until_available(&self, estimate: Tokens) -> ThrottleResult<TimestampMs> {
        self.with_engine(|e| e.time_until_available(estimate))
    }

    pub async fn consume(
        &self,
        request_id: impl Into<String>,
        estimate: Tokens,
        metadata: Option<M>,
    ) -> ThrottleResult<bool> {
        let request_id = request_id.into();
        self.exclusive(|e| e.consume(&request_id, estimate, metadata)).await?
    }

    pub async fn consume_or_fail(
        &self,
        request_id: impl Into<String>,
        estimate: Tokens,
        metadata: Option<M>,
    ) -> ThrottleResult<Admission> {
        let request_id = request_id.into();
        self.exclusive(|e| e.consume_or_fail(&request_id, estimate, metadata))
            .await?
    }

    pub async fn adjust_consumption(&self, request_id: impl Into<String>, actual: Tokens) -> ThrottleResult<()> {
        let request_id = request_id.into();
        self.exclusive(|e| e.adjust_consumption(&request_id, actual)).await?
    }

    pub async fn reset(&self) -> ThrottleResult<()> {
        self.exclusive(|e| e.reset()).await
    }

    pub async fn set_retention_window(&self, ms: TimestampMs) -> ThrottleResult<()> {
        self.exclusive(|e| e.set_retention_window(ms)).await?
    }

    pub async fn set_max_records(&self, n: usize) -> ThrottleResult<()> {
        self.exclusive(|e| e.set_max_records(n)).await?
    }

    pub async fn restore_from_snapshot(&self, snapshot: &StateSnapshot) -> ThrottleResult<()> {
        self.exclusive(|e| e.restore_from_snapshot(snapshot)).await?
    }

    pub async fn repair_state(&self) -> ThrottleResult<bool> {
        self.exclusive(|e| e.repair_state()).await
    }

    pub fn get_metrics(&self) -> ThrottleMetrics {
        self.with_engine(|e| e.get_metrics())
    }

    pub fn get_history(&self) -> Vec<ConsumptionRecord<M>> {
        self.with_engine(|e| e.get_history().to_vec())
    }

    pub fn get_stats(&self) -> LedgerStats {
        self.with_engine(|e| e.get_stats())
    }

    pub fn compensation_debt(&self) -> Tokens {
        self.with_engine(|e| e.compensation_debt())
    }

    pub fn validate_state(&self) -> bool {
        self.with_engine(|e| e.validate_state())
    }

    pub fn create_snapshot(&self) -> StateSnapshot {
        self.with_engine(|e| e.create_snapshot())
    }

    /// Cancels every caller still queued on the gate, then waits for
    /// pending persistence writes. Returns how many callers were cancelled.
    pub async fn shutdown(&self) -> usize {
        let cancelled = self.gate.drain();
        let persistence = self.with_engine(|e| e.persistence().cloned());
        if let Some(persistence) = persistence {
            persistence.flush().await;
        }
        cancelled
    }

    /// Unwraps the engine, e.g. to go back to single-owner use.
    pub fn into_inner(self) -> ThrottleEngine<M> {
        self.engine.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}
