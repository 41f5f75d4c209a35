//! Bounded consumption ledger.
//!
//! Records are kept in insertion order, which is also timestamp order since
//! the engine stamps them from a single clock. The ledger is bounded twice:
//! by age (the retention window) and by count (`max_records`, oldest evicted
//! first).

use std::collections::VecDeque;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::types::{TimestampMs, Tokens};

/// Evicting more than this many records in one pass is logged as a warning.
pub const EVICTION_WARN_THRESHOLD: usize = 10;

/// Efficiency reported when no reconciled record is in the window.
pub const DEFAULT_EFFICIENCY: f64 = 0.85;

/// One admitted request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionRecord<M = ()> {
    pub timestamp_ms: TimestampMs,
    pub request_id: String,
    /// Current charge: the estimate until reconciled, then the actual amount.
    pub tokens: Tokens,
    pub estimated_tokens: Tokens,
    /// Set by reconciliation.
    pub actual_tokens: Option<Tokens>,
    /// Caller payload; never inspected.
    pub metadata: Option<M>,
    /// Compensation debt paid down when this request was admitted.
    pub compensation_debt_applied: Tokens,
}

impl<M> ConsumptionRecord<M> {
    pub fn is_reconciled(&self) -> bool {
        self.actual_tokens.is_some()
    }

    /// `min(estimated, actual) / max(estimated, actual)`, or `None` when the
    /// record has not been reconciled.
    pub fn accuracy(&self) -> Option<f64> {
        let actual = self.actual_tokens?;
        Some(accuracy_ratio(self.estimated_tokens, actual))
    }
}

fn accuracy_ratio(estimated: Tokens, actual: Tokens) -> f64 {
    let hi = estimated.max(actual);
    if hi <= 0.0 {
        // Both zero: the estimate was exact.
        return 1.0;
    }
    estimated.min(actual) / hi
}

/// Ledger-wide statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total_records: usize,
    pub reconciled_records: usize,
    pub total_estimated_tokens: Tokens,
    pub total_actual_tokens: Tokens,
    /// Mean accuracy over every reconciled record; `1.0` when there is none.
    pub estimation_accuracy: f64,
    pub oldest_timestamp_ms: Option<TimestampMs>,
    pub newest_timestamp_ms: Option<TimestampMs>,
}

#[derive(Debug, Clone)]
pub struct ConsumptionLedger<M = ()> {
    records: VecDeque<ConsumptionRecord<M>>,
    retention_window_ms: TimestampMs,
    max_records: usize,
}

impl<M> ConsumptionLedger<M> {
    pub fn new(retention_window_ms: TimestampMs, max_records: usize) -> Self {
        Self {
            records: VecDeque::new(),
            retention_window_ms,
            max_records,
        }
    }

    pub fn retention_window_ms(&self) -> TimestampMs {
        self.retention_window_ms
    }

    pub fn max_records(&self) -> usize {
        self.max_records
    }

    pub fn set_retention_window(&mut self, ms: TimestampMs) {
        self.retention_window_ms = ms;
    }

    pub fn set_max_records(&mut self, n: usize) {
        self.max_records = n;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether a record stamped `timestamp_ms` is still inside the window at
    /// `now`. Nothing has expired before one full window has elapsed.
    fn is_live(&self, timestamp_ms: TimestampMs, now: TimestampMs) -> bool {
        match now.checked_sub(self.retention_window_ms) {
            Some(cutoff) => timestamp_ms > cutoff,
            None => true,
        }
    }

    pub fn push(&mut self, record: ConsumptionRecord<M>) {
        self.records.push_back(record);
    }

    /// Whether a live (not yet expired) record carries `request_id`.
    pub fn contains_active(&self, request_id: &str, now: TimestampMs) -> bool {
        self.records
            .iter()
            .any(|r| r.request_id == request_id && self.is_live(r.timestamp_ms, now))
    }

    /// Most recent live record for `request_id`.
    pub fn find_active_mut(&mut self, request_id: &str, now: TimestampMs) -> Option<&mut ConsumptionRecord<M>> {
        let retention = self.retention_window_ms;
        self.records.iter_mut().rev().find(|r| {
            r.request_id == request_id
                && now.checked_sub(retention).map_or(true, |cutoff| r.timestamp_ms > cutoff)
        })
    }

    /// Drops records with `timestamp <= now - retention`. Returns how many went.
    pub fn prune_expired(&mut self, now: TimestampMs) -> usize {
        let Some(cutoff) = now.checked_sub(self.retention_window_ms) else {
            return 0;
        };
        let before = self.records.len();
        self.records.retain(|r| r.timestamp_ms > cutoff);
        before - self.records.len()
    }

    /// Evicts the oldest records beyond `max_records`. Returns how many went.
    pub fn enforce_bound(&mut self) -> usize {
        let excess = self.records.len().saturating_sub(self.max_records);
        if excess == 0 {
            return 0;
        }

        self.records.drain(..excess);
        if excess > EVICTION_WARN_THRESHOLD {
            warn!(
                "consumption ledger over its bound of {} records, evicted {} oldest",
                self.max_records, excess
            );
        }
        excess
    }

    /// Retention pruning followed by the size bound.
    pub fn trim(&mut self, now: TimestampMs) -> usize {
        self.prune_expired(now) + self.enforce_bound()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn records(&mut self) -> &[ConsumptionRecord<M>] {
        self.records.make_contiguous()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ConsumptionRecord<M>> {
        self.records.iter()
    }

    /// Removes records that fail `keep`. Returns how many went.
    pub fn retain<F>(&mut self, keep: F) -> usize
    where
        F: FnMut(&ConsumptionRecord<M>) -> bool,
    {
        let before = self.records.len();
        self.records.retain(keep);
        before - self.records.len()
    }

    /// Mean accuracy of the last `window` reconciled records, newest first.
    ///
    /// Falls back to [`DEFAULT_EFFICIENCY`] when none is reconciled: an
    /// unknown efficiency is assumed imperfect.
    pub fn efficiency(&self, window: usize) -> f64 {
        let ratios: Vec<f64> = self
            .records
            .iter()
            .rev()
            .filter_map(ConsumptionRecord::accuracy)
            .take(window)
            .collect();

        if ratios.is_empty() {
            return DEFAULT_EFFICIENCY;
        }
        ratios.iter().sum::<f64>() / ratios.len() as f64
    }

    pub fn stats(&self) -> LedgerStats {
        let mut reconciled = 0usize;
        let mut accuracy_sum = 0.0;
        let mut total_estimated = 0.0;
        let mut total_actual = 0.0;

        for record in &self.records {
            total_estimated += record.estimated_tokens;
            if let (Some(actual), Some(ratio)) = (record.actual_tokens, record.accuracy()) {
                reconciled += 1;
                accuracy_sum += ratio;
                total_actual += actual;
            }
        }

        LedgerStats {
            total_records: self.records.len(),
            reconciled_records: reconciled,
            total_estimated_tokens: total_estimated,
            total_actual_tokens: total_actual,
            estimation_accuracy: if reconciled == 0 {
                1.0
            } else {
                accuracy_sum / reconciled as f64
            },
            oldest_timestamp_ms: self.records.front().map(|r| r.timestamp_ms),
            newest_timestamp_ms: self.records.back().map(|r| r.timestamp_ms),
        }
    }
}

impl<M> Extend<ConsumptionRecord<M>> for ConsumptionLedger<M> {
    fn extend<I: IntoIterator<Item = ConsumptionRecord<M>>>(&mut self, iter: I) {
        self.records.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: TimestampMs, id: &str, estimated: Tokens, actual: Option<Tokens>) -> ConsumptionRecord {
        ConsumptionRecord {
            timestamp_ms: ts,
            request_id: id.to_string(),
            tokens: actual.unwrap_or(estimated),
            estimated_tokens: estimated,
            actual_tokens: actual,
            metadata: None,
            compensation_debt_applied: 0.0,
        }
    }

    #[test]
    fn test_prune_drops_records_at_the_cutoff() {
        let mut ledger = ConsumptionLedger::new(1_000, 100);
        ledger.push(record(0, "a", 1.0, None));
        ledger.push(record(500, "b", 1.0, None));
        ledger.push(record(1_200, "c", 1.0, None));

        // cutoff = 1500 - 1000 = 500, so "b" (ts == cutoff) goes too
        assert_eq!(ledger.prune_expired(1_500), 2);
        assert_eq!(ledger.records()[0].request_id, "c");
    }

    #[test]
    fn test_bound_evicts_oldest_first() {
        let mut ledger = ConsumptionLedger::new(60_000, 3);
        for i in 0..5 {
            ledger.push(record(i, &format!("r{}", i), 1.0, None));
        }
        assert_eq!(ledger.enforce_bound(), 2);
        let ids: Vec<_> = ledger.iter().map(|r| r.request_id.as_str()).collect();
        assert_eq!(ids, vec!["r2", "r3", "r4"]);
    }

    #[test]
    fn test_efficiency_uses_only_recent_reconciled_records() {
        let mut ledger = ConsumptionLedger::new(60_000, 100);
        ledger.push(record(1, "old", 100.0, Some(50.0)));
        ledger.push(record(2, "pending", 100.0, None));
        ledger.push(record(3, "new", 100.0, Some(100.0)));

        assert_eq!(ledger.efficiency(1), 1.0);
        assert_eq!(ledger.efficiency(10), 0.75);
    }

    #[test]
    fn test_efficiency_and_accuracy_defaults_differ() {
        let mut ledger = ConsumptionLedger::new(60_000, 100);
        ledger.push(record(1, "pending", 100.0, None));

        assert_eq!(ledger.efficiency(50), DEFAULT_EFFICIENCY);
        assert_eq!(ledger.stats().estimation_accuracy, 1.0);
    }

    #[test]
    fn test_zero_estimate_and_zero_actual_is_exact() {
        let r = record(1, "z", 0.0, Some(0.0));
        assert_eq!(r.accuracy(), Some(1.0));
    }
}
