//! FIFO asynchronous mutual-exclusion gate.
//!
//! The gate owns no data. It only orders compound read-modify-write sequences:
//! callers are granted the lock strictly in the order they asked for it, and a
//! release hands the lock directly to the longest-waiting caller.
//!
//! ```rust
//! use rate_guard_throttle::gate::Gate;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let gate = Gate::new();
//! let value = gate.run_exclusive(|| async { 40 + 2 }).await.unwrap();
//! assert_eq!(value, 42);
//! assert!(!gate.is_locked());
//! # }
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;
use tokio::sync::oneshot;

use crate::{ThrottleError, ThrottleResult};

/// Message delivered to a queued waiter: `true` grants the lock, `false` cancels.
type Grant = oneshot::Sender<bool>;

#[derive(Debug, Default)]
struct GateState {
    locked: bool,
    /// Bumped by `drain` so guards from before the drain cannot release a
    /// lock granted after it.
    epoch: u64,
    waiters: VecDeque<Grant>,
}

/// FIFO queue-backed asynchronous lock.
#[derive(Debug, Default)]
pub struct Gate {
    state: Mutex<GateState>,
}

/// Proof that the gate is held. Dropping it releases the gate.
#[derive(Debug)]
#[must_use = "the gate is released as soon as the guard is dropped"]
pub struct GateGuard<'a> {
    gate: &'a Gate,
    epoch: u64,
    released: bool,
}

/// Pending acquisition. Cleans up if the acquiring future is dropped.
struct Waiter<'a> {
    gate: &'a Gate,
    epoch: u64,
    rx: Option<oneshot::Receiver<bool>>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquires the gate, waiting behind every earlier caller.
    ///
    /// # Errors
    ///
    /// [`ThrottleError::Cancelled`] if the gate is drained while this caller
    /// is still queued.
    pub async fn acquire(&self) -> ThrottleResult<GateGuard<'_>> {
        let mut waiter = {
            let mut state = self.lock_state();
            if !state.locked {
                state.locked = true;
                return Ok(GateGuard {
                    gate: self,
                    epoch: state.epoch,
                    released: false,
                });
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            Waiter {
                gate: self,
                epoch: state.epoch,
                rx: Some(rx),
            }
        };

        let granted = match waiter.rx.as_mut() {
            Some(rx) => rx.await.unwrap_or(false),
            None => false,
        };
        // The grant was consumed here; the waiter must not release on drop.
        waiter.rx = None;

        if granted {
            Ok(GateGuard {
                gate: self,
                epoch: waiter.epoch,
                released: false,
            })
        } else {
            Err(ThrottleError::Cancelled)
        }
    }

    /// Runs `f` while holding the gate.
    ///
    /// The gate is released on every exit path of `f`, including errors
    /// returned by it and panics unwinding through it.
    pub async fn run_exclusive<F, Fut, T>(&self, f: F) -> ThrottleResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire().await?;
        Ok(f().await)
    }

    /// Rejects every queued waiter with [`ThrottleError::Cancelled`] and
    /// marks the gate free.
    ///
    /// Teardown only. A section already running is not interrupted, but its
    /// guard no longer owns the gate and releasing it reports
    /// [`ThrottleError::InvalidState`].
    pub fn drain(&self) -> usize {
        let mut state = self.lock_state();
        let waiters: Vec<Grant> = state.waiters.drain(..).collect();
        state.locked = false;
        state.epoch = state.epoch.wrapping_add(1);
        drop(state);

        // A waiter whose future was dropped has closed its receiver, so the
        // send fails and it is not counted.
        let count = waiters
            .into_iter()
            .map(|tx| tx.send(false))
            .filter(Result::is_ok)
            .count();
        if count > 0 {
            debug!("gate drained, cancelled {} waiter(s)", count);
        }
        count
    }

    /// Whether some caller currently holds the gate.
    pub fn is_locked(&self) -> bool {
        self.lock_state().locked
    }

    /// Number of callers waiting for the gate. Abandoned waiters are not
    /// counted.
    pub fn queue_len(&self) -> usize {
        self.lock_state().waiters.iter().filter(|tx| !tx.is_closed()).count()
    }

    fn release_epoch(&self, epoch: u64) -> ThrottleResult<()> {
        let mut state = self.lock_state();
        if !state.locked || state.epoch != epoch {
            return Err(ThrottleError::InvalidState(
                "release of a gate that is not held".to_string(),
            ));
        }

        // Hand the lock straight to the oldest waiter still listening.
        while let Some(tx) = state.waiters.pop_front() {
            if tx.send(true).is_ok() {
                return Ok(());
            }
        }
        state.locked = false;
        Ok(())
    }
}

impl GateGuard<'_> {
    /// Releases the gate explicitly.
    ///
    /// # Errors
    ///
    /// [`ThrottleError::InvalidState`] if the gate was drained while this
    /// guard was held.
    pub fn release(mut self) -> ThrottleResult<()> {
        self.released = true;
        self.gate.release_epoch(self.epoch)
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.gate.release_epoch(self.epoch) {
                debug!("gate guard dropped: {}", e);
            }
        }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        // Dropped while still queued: if the grant raced in, pass it on.
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if let Ok(true) = rx.try_recv() {
                let _ = self.gate.release_epoch(self.epoch);
            }
        }
    }
}
