//! Dual-constraint throttle engine.
//!
//! The engine combines a requests bucket (rate dimension) and a
//! consumed-units bucket (volume dimension). A request is admitted when one
//! request and its estimated units are both available; once the true amount
//! is known the caller reconciles it and the volume bucket is corrected by
//! the difference.
//!
//! [`ThrottleEngine`] is the single-owner form: every mutation takes
//! `&mut self`. Concurrent callers share a
//! [`SharedThrottle`](crate::shared::SharedThrottle), which runs the same
//! operations behind a FIFO [`Gate`](crate::gate::Gate).

use std::sync::Arc;

use log::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{AdjustmentStrategy, ThrottleConfig};
use crate::cores::ResourceBucket;
use crate::ledger::{ConsumptionLedger, ConsumptionRecord, LedgerStats};
use crate::persistence::{
    PersistenceCommand, PersistenceHandle, RestoredState, RATE_BUCKET_KEY, VOLUME_BUCKET_KEY,
};
use crate::types::{is_valid_amount, TimestampMs, Tokens};
use crate::{LimitReason, ThrottleError, ThrottleResult};

mod metrics;
pub(crate) mod strategy;

pub use metrics::{Admission, Availability, DimensionMetrics, StateSnapshot, ThrottleMetrics};
use strategy::{Shortfall, ShortfallHandler};

/// How far in the future a record timestamp may lie before the state is
/// considered invalid.
pub const CLOCK_SKEW_TOLERANCE_MS: TimestampMs = 5_000;

/// Admission control over a rate bucket and a volume bucket, with a ledger
/// of admitted requests for later reconciliation.
///
/// `M` is caller metadata stored with each record and never inspected.
pub struct ThrottleEngine<M = ()> {
    rate: ResourceBucket,
    volume: ResourceBucket,
    ledger: ConsumptionLedger<M>,
    compensation_debt: Tokens,
    strategy: AdjustmentStrategy,
    on_shortfall: ShortfallHandler,
    efficiency_window_size: usize,
    clock: Arc<dyn Clock>,
    persistence: Option<PersistenceHandle<M>>,
}

impl<M> std::fmt::Debug for ThrottleEngine<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleEngine")
            .field("rate", &self.rate)
            .field("volume", &self.volume)
            .field("ledger_size", &self.ledger.len())
            .field("compensation_debt", &self.compensation_debt)
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl<M: Clone + Send + 'static> ThrottleEngine<M> {
    /// Creates an engine reading the system wall clock.
    pub fn new(config: ThrottleConfig) -> ThrottleResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates an engine driven by `clock`.
    ///
    /// # Errors
    ///
    /// [`ThrottleError::Configuration`] with every problem in `config`.
    pub fn with_clock(config: ThrottleConfig, clock: Arc<dyn Clock>) -> ThrottleResult<Self> {
        config.validate()?;

        let now = clock.now_ms();
        let rate = ResourceBucket::new(config.rate_bucket(), now)?;
        let volume = ResourceBucket::new(config.volume_bucket(), now)?;

        Ok(Self {
            rate,
            volume,
            ledger: ConsumptionLedger::new(config.retention_window_ms, config.max_records),
            compensation_debt: 0.0,
            strategy: config.adjustment_strategy,
            on_shortfall: config.adjustment_strategy.handler(),
            efficiency_window_size: config.efficiency_window_size,
            clock,
            persistence: None,
        })
    }

    /// Attaches a persistence worker. State is not loaded until
    /// [`initialize`](Self::initialize) is called.
    pub fn with_persistence(mut self, persistence: PersistenceHandle<M>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// The attached persistence worker, if any.
    pub fn persistence(&self) -> Option<&PersistenceHandle<M>> {
        self.persistence.as_ref()
    }

    /// Strategy applied when a reconciliation cannot be covered.
    pub fn strategy(&self) -> AdjustmentStrategy {
        self.strategy
    }

    /// Units owed by past reconciliations, charged to the next admission.
    pub fn compensation_debt(&self) -> Tokens {
        self.compensation_debt
    }

    /// Restores checkpointed state from the persistence backend.
    ///
    /// A stored bucket is only imported when its capacity matches the live
    /// configuration. Failures are logged and leave the engine as configured.
    pub async fn initialize(&mut self) {
        let Some(persistence) = self.persistence.clone() else {
            return;
        };
        let restored = RestoredState::load(persistence.backend().as_ref()).await;
        self.apply_restored(restored);
    }

    pub(crate) fn apply_restored(&mut self, restored: RestoredState<M>) {
        let now = self.clock.now_ms();

        if let Some(state) = restored.rate {
            match self.rate.import_state(state) {
                Ok(()) => debug!("restored rate bucket: {} available", state.available),
                Err(e) => info!("discarding persisted rate bucket: {}", e),
            }
        }
        if let Some(state) = restored.volume {
            match self.volume.import_state(state) {
                Ok(()) => debug!("restored volume bucket: {} available", state.available),
                Err(e) => info!("discarding persisted volume bucket: {}", e),
            }
        }
        if let Some(debt) = restored.debt {
            self.compensation_debt = debt;
        }

        if !restored.ledger.is_empty() {
            let mut records = restored.ledger;
            records.retain(|r| is_valid_amount(r.tokens) && r.timestamp_ms <= now + CLOCK_SKEW_TOLERANCE_MS);
            records.sort_by_key(|r| r.timestamp_ms);
            self.ledger.clear();
            self.ledger.extend(records);
            self.ledger.trim(now);
            debug!("restored {} ledger record(s)", self.ledger.len());
        }
    }

    /// Checks whether `estimate` units could be admitted right now.
    ///
    /// The rate dimension is checked first, so a request violating both
    /// limits reports [`LimitReason::RateLimit`]. Compensation debt is not
    /// included here; [`consume`](Self::consume) adds it.
    pub fn can_process(&mut self, estimate: Tokens) -> ThrottleResult<Admission> {
        check_amount("estimate", estimate)?;
        let now = self.clock.now_ms();
        Ok(self.admission_at(now, estimate))
    }

    fn admission_at(&mut self, now: TimestampMs, amount: Tokens) -> Admission {
        if !self.rate.has_capacity_at(now, 1.0) {
            let retry = self.rate.time_until_available_at(now, 1.0);
            return Admission::denied(LimitReason::RateLimit, retry, self.availability_at(now));
        }
        if !self.volume.has_capacity_at(now, amount) {
            let retry = self.volume.time_until_available_at(now, amount);
            return Admission::denied(LimitReason::VolumeLimit, retry, self.availability_at(now));
        }
        Admission::allowed(self.availability_at(now))
    }

    fn availability_at(&mut self, now: TimestampMs) -> Availability {
        Availability {
            rate: self.rate.available_at(now),
            volume: self.volume.available_at(now),
        }
    }

    /// Milliseconds until a request of `estimate` units (plus any
    /// compensation debt) would be admitted.
    pub fn time_until_available(&mut self, estimate: Tokens) -> ThrottleResult<TimestampMs> {
        check_amount("estimate", estimate)?;
        let now = self.clock.now_ms();
        let rate_wait = self.rate.time_until_available_at(now, 1.0);
        let volume_wait = self
            .volume
            .time_until_available_at(now, estimate + self.compensation_debt);
        Ok(rate_wait.max(volume_wait))
    }

    /// Admits `request_id` for `estimate` units if both dimensions allow it.
    ///
    /// Outstanding compensation debt is charged on top of the estimate and
    /// cleared on success. A denial changes nothing, debt included.
    ///
    /// Returns `Ok(false)` on denial; use
    /// [`consume_or_fail`](Self::consume_or_fail) to get the reason.
    pub fn consume(&mut self, request_id: &str, estimate: Tokens, metadata: Option<M>) -> ThrottleResult<bool> {
        self.try_consume(request_id, estimate, metadata)
            .map(|admission| admission.allowed)
    }

    /// Like [`consume`](Self::consume) but a denial is
    /// [`ThrottleError::AdmissionDenied`] carrying the reason and retry delay.
    pub fn consume_or_fail(
        &mut self,
        request_id: &str,
        estimate: Tokens,
        metadata: Option<M>,
    ) -> ThrottleResult<Admission> {
        let admission = self.try_consume(request_id, estimate, metadata)?;
        if admission.allowed {
            Ok(admission)
        } else {
            Err(ThrottleError::AdmissionDenied {
                reason: admission.reason.unwrap_or(LimitReason::RateLimit),
                retry_after_ms: admission.retry_after_ms.unwrap_or(0),
            })
        }
    }

    fn try_consume(&mut self, request_id: &str, estimate: Tokens, metadata: Option<M>) -> ThrottleResult<Admission> {
        if request_id.trim().is_empty() {
            return Err(ThrottleError::InvalidArgument(
                "request id must not be empty".to_string(),
            ));
        }
        check_amount("estimate", estimate)?;

        let now = self.clock.now_ms();
        if self.ledger.contains_active(request_id, now) {
            return Err(ThrottleError::InvalidArgument(format!(
                "request id '{}' is already in the ledger",
                request_id
            )));
        }

        let debt = self.compensation_debt;
        let needed = estimate + debt;
        let admission = self.admission_at(now, needed);
        if !admission.allowed {
            debug!(
                "denied '{}' for {} tokens ({} debt): {:?}",
                request_id, estimate, debt, admission.reason
            );
            return Ok(admission);
        }

        self.debit_at(now, needed)?;
        self.compensation_debt = 0.0;

        let record = ConsumptionRecord {
            timestamp_ms: now,
            request_id: request_id.to_string(),
            tokens: estimate,
            estimated_tokens: estimate,
            actual_tokens: None,
            metadata,
            compensation_debt_applied: debt,
        };
        if let Some(persistence) = &self.persistence {
            persistence.submit(PersistenceCommand::AppendRecord(record.clone()));
            persistence.submit(PersistenceCommand::SaveBucket {
                key: RATE_BUCKET_KEY,
                state: self.rate.export_state(),
            });
            persistence.submit(PersistenceCommand::SaveBucket {
                key: VOLUME_BUCKET_KEY,
                state: self.volume.export_state(),
            });
            if debt > 0.0 {
                persistence.submit(PersistenceCommand::SaveDebt(0.0));
            }
        }
        self.ledger.push(record);
        self.trim_at(now);

        Ok(Admission::allowed(self.availability_at(now)))
    }

    /// Takes one request and `needed` units together. Admission was checked
    /// at the same instant, so a refusal here is an engine bug.
    fn debit_at(&mut self, now: TimestampMs, needed: Tokens) -> ThrottleResult<()> {
        if !self.rate.consume_at(now, 1.0)? {
            return Err(ThrottleError::InvalidState(
                "rate bucket refused a debit that passed admission".to_string(),
            ));
        }
        if !self.volume.consume_at(now, needed)? {
            self.rate.refund_at(now, 1.0)?;
            return Err(ThrottleError::InvalidState(
                "volume bucket refused a debit that passed admission".to_string(),
            ));
        }
        Ok(())
    }

    /// Reconciles `request_id` with the amount it actually used.
    ///
    /// The volume bucket is charged or refunded by the difference from the
    /// record's current charge. When the extra charge cannot be covered the
    /// configured [`AdjustmentStrategy`] decides:
    ///
    /// * `Strict` - fails with `AdmissionDenied`; nothing changes
    /// * `Warn` - logs and drops the shortfall
    /// * `Compensate` - adds the shortfall to the compensation debt
    pub fn adjust_consumption(&mut self, request_id: &str, actual: Tokens) -> ThrottleResult<()> {
        check_amount("actual", actual)?;

        let now = self.clock.now_ms();
        let current = self
            .ledger
            .find_active_mut(request_id, now)
            .map(|r| r.tokens)
            .ok_or_else(|| ThrottleError::NotFound {
                request_id: request_id.to_string(),
            })?;

        let delta = actual - current;
        if delta > 0.0 {
            if !self.volume.consume_at(now, delta)? {
                let retry_after_ms = self.volume.time_until_available_at(now, delta);
                let on_shortfall = self.on_shortfall;
                on_shortfall(Shortfall {
                    request_id,
                    delta,
                    retry_after_ms,
                    debt: &mut self.compensation_debt,
                })?;
            }
        } else if delta < 0.0 {
            self.volume.refund_at(now, -delta)?;
        }

        if let Some(record) = self.ledger.find_active_mut(request_id, now) {
            record.tokens = actual;
            record.actual_tokens = Some(actual);
        }
        debug!("reconciled '{}': {} -> {} tokens", request_id, current, actual);

        if let Some(persistence) = &self.persistence {
            persistence.submit(PersistenceCommand::SaveBucket {
                key: VOLUME_BUCKET_KEY,
                state: self.volume.export_state(),
            });
            persistence.submit(PersistenceCommand::SaveDebt(self.compensation_debt));
            persistence.submit(PersistenceCommand::SaveLedger(self.ledger.iter().cloned().collect()));
        }
        self.trim_at(now);
        Ok(())
    }

    /// Applies retention and the size bound, and mirrors the result to
    /// persistence. An eviction by count rewrites the stored ledger, since a
    /// cutoff prune only drops records by age.
    fn trim_at(&mut self, now: TimestampMs) {
        let expired = self.ledger.prune_expired(now);
        let evicted = self.ledger.enforce_bound();
        let Some(persistence) = &self.persistence else {
            return;
        };
        if evicted > 0 {
            persistence.submit(PersistenceCommand::SaveLedger(self.ledger.iter().cloned().collect()));
        } else if expired > 0 {
            persistence.submit(PersistenceCommand::PruneLedger {
                cutoff_ms: now.saturating_sub(self.ledger.retention_window_ms()),
            });
        }
    }

    /// Usage of both dimensions, estimation efficiency, debt and ledger
    /// size. Trims the ledger first.
    pub fn get_metrics(&mut self) -> ThrottleMetrics {
        let now = self.clock.now_ms();
        self.trim_at(now);

        ThrottleMetrics {
            rate: DimensionMetrics::from_bucket(&mut self.rate, now),
            volume: DimensionMetrics::from_bucket(&mut self.volume, now),
            efficiency: self.ledger.efficiency(self.efficiency_window_size),
            compensation_debt: self.compensation_debt,
            ledger_size: self.ledger.len(),
        }
    }

    /// Live records, oldest first.
    pub fn get_history(&mut self) -> &[ConsumptionRecord<M>] {
        let now = self.clock.now_ms();
        self.trim_at(now);
        self.ledger.records()
    }

    /// Totals and mean estimation accuracy over the live ledger.
    pub fn get_stats(&mut self) -> LedgerStats {
        let now = self.clock.now_ms();
        self.trim_at(now);
        self.ledger.stats()
    }

    /// Refills both buckets and forgets the ledger and any debt.
    pub fn reset(&mut self) {
        let now = self.clock.now_ms();
        self.rate.reset_at(now);
        self.volume.reset_at(now);
        self.ledger.clear();
        self.compensation_debt = 0.0;
        if let Some(persistence) = &self.persistence {
            persistence.submit(PersistenceCommand::Clear);
        }
        info!("throttle engine reset");
    }

    /// Changes how long records stay reconcilable and trims at once.
    ///
    /// # Errors
    ///
    /// [`ThrottleError::InvalidArgument`] for a zero window.
    pub fn set_retention_window(&mut self, ms: TimestampMs) -> ThrottleResult<()> {
        if ms == 0 {
            return Err(ThrottleError::InvalidArgument(
                "retention window must be greater than 0 ms".to_string(),
            ));
        }
        self.ledger.set_retention_window(ms);
        let now = self.clock.now_ms();
        self.trim_at(now);
        Ok(())
    }

    /// Changes the ledger size bound, evicting the oldest records at once.
    ///
    /// # Errors
    ///
    /// [`ThrottleError::InvalidArgument`] for zero.
    pub fn set_max_records(&mut self, n: usize) -> ThrottleResult<()> {
        if n == 0 {
            return Err(ThrottleError::InvalidArgument(
                "max records must be greater than 0".to_string(),
            ));
        }
        self.ledger.set_max_records(n);
        let now = self.clock.now_ms();
        self.trim_at(now);
        Ok(())
    }

    fn record_in_bounds(r: &ConsumptionRecord<M>, lower: TimestampMs, upper: TimestampMs) -> bool {
        r.timestamp_ms >= lower && r.timestamp_ms <= upper && is_valid_amount(r.tokens)
    }

    fn record_bounds(&self, now: TimestampMs) -> (TimestampMs, TimestampMs) {
        let retention = self.ledger.retention_window_ms();
        (
            now.saturating_sub(retention.saturating_mul(2)),
            now.saturating_add(CLOCK_SKEW_TOLERANCE_MS),
        )
    }

    /// Consistency probe for an external supervisor.
    ///
    /// Each failed check is logged. See [`repair_state`](Self::repair_state).
    pub fn validate_state(&self) -> bool {
        let now = self.clock.now_ms();
        let mut problems = Vec::new();

        if !self.rate.check_consistency() {
            problems.push("rate bucket inconsistent".to_string());
        }
        if !self.volume.check_consistency() {
            problems.push("volume bucket inconsistent".to_string());
        }
        if !is_valid_amount(self.compensation_debt) {
            problems.push(format!("compensation debt is {}", self.compensation_debt));
        }
        let size_limit = self.ledger.max_records() as f64 * 1.1;
        if self.ledger.len() as f64 > size_limit {
            problems.push(format!(
                "ledger holds {} records, bound is {}",
                self.ledger.len(),
                self.ledger.max_records()
            ));
        }
        let (lower, upper) = self.record_bounds(now);
        let bad = self
            .ledger
            .iter()
            .filter(|r| !Self::record_in_bounds(r, lower, upper))
            .count();
        if bad > 0 {
            problems.push(format!("{} ledger record(s) out of window or negative", bad));
        }

        for problem in &problems {
            warn!("throttle state invalid: {}", problem);
        }
        problems.is_empty()
    }

    /// Clamps a bad debt to zero, drops out-of-window or negative records
    /// and enforces the size bound. Returns whether anything was changed.
    pub fn repair_state(&mut self) -> bool {
        let now = self.clock.now_ms();
        let mut repaired = false;

        if !is_valid_amount(self.compensation_debt) {
            warn!("resetting compensation debt {} to 0", self.compensation_debt);
            self.compensation_debt = 0.0;
            repaired = true;
        }

        let (lower, upper) = self.record_bounds(now);
        let dropped = self.ledger.retain(|r| Self::record_in_bounds(r, lower, upper));
        if dropped > 0 {
            warn!("dropped {} invalid ledger record(s)", dropped);
            repaired = true;
        }
        if self.ledger.enforce_bound() > 0 {
            repaired = true;
        }

        if repaired {
            if let Some(persistence) = &self.persistence {
                persistence.submit(PersistenceCommand::SaveDebt(self.compensation_debt));
                persistence.submit(PersistenceCommand::SaveLedger(self.ledger.iter().cloned().collect()));
            }
        }
        repaired
    }

    /// Captures both buckets, refilled to now, and the debt.
    pub fn create_snapshot(&mut self) -> StateSnapshot {
        let now = self.clock.now_ms();
        self.rate.available_at(now);
        self.volume.available_at(now);

        StateSnapshot {
            rate: self.rate.export_state(),
            volume: self.volume.export_state(),
            compensation_debt: self.compensation_debt,
            taken_at_ms: now,
        }
    }

    /// Replaces bucket state and debt with `snapshot` and empties the ledger.
    ///
    /// # Errors
    ///
    /// [`ThrottleError::InvalidState`] if either bucket state or the debt is
    /// invalid. Everything is validated first, so on error nothing changed.
    pub fn restore_from_snapshot(&mut self, snapshot: &StateSnapshot) -> ThrottleResult<()> {
        self.rate.validate_import(&snapshot.rate)?;
        self.volume.validate_import(&snapshot.volume)?;
        if !is_valid_amount(snapshot.compensation_debt) {
            return Err(ThrottleError::InvalidState(format!(
                "snapshot compensation debt is {}",
                snapshot.compensation_debt
            )));
        }

        self.rate.import_state(snapshot.rate)?;
        self.volume.import_state(snapshot.volume)?;
        self.compensation_debt = snapshot.compensation_debt;
        self.ledger.clear();

        if let Some(persistence) = &self.persistence {
            persistence.submit(PersistenceCommand::SaveBucket {
                key: RATE_BUCKET_KEY,
                state: snapshot.rate,
            });
            persistence.submit(PersistenceCommand::SaveBucket {
                key: VOLUME_BUCKET_KEY,
                state: snapshot.volume,
            });
            persistence.submit(PersistenceCommand::SaveDebt(snapshot.compensation_debt));
            persistence.submit(PersistenceCommand::SaveLedger(Vec::new()));
        }
        info!("restored throttle state from snapshot taken at {}", snapshot.taken_at_ms);
        Ok(())
    }
}

fn check_amount(name: &str, value: Tokens) -> ThrottleResult<()> {
    if is_valid_amount(value) {
        Ok(())
    } else {
        Err(ThrottleError::InvalidArgument(format!(
            "{} must be a non-negative number, got {}",
            name, value
        )))
    }
}
