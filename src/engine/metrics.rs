use serde::{Deserialize, Serialize};

use crate::cores::{BucketState, ResourceBucket};
use crate::types::{TimestampMs, Tokens};
use crate::LimitReason;

/// Current balance of both buckets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Availability {
    pub rate: Tokens,
    pub volume: Tokens,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Admission {
    pub allowed: bool,
    /// Set when `allowed` is false.
    pub reason: Option<LimitReason>,
    /// Set when `allowed` is false.
    pub retry_after_ms: Option<TimestampMs>,
    pub available: Availability,
}

impl Admission {
    pub(crate) fn allowed(available: Availability) -> Self {
        Self {
            allowed: true,
            reason: None,
            retry_after_ms: None,
            available,
        }
    }

    pub(crate) fn denied(reason: LimitReason, retry_after_ms: TimestampMs, available: Availability) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            retry_after_ms: Some(retry_after_ms),
            available,
        }
    }
}

/// Usage of one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionMetrics {
    pub used: Tokens,
    pub available: Tokens,
    pub limit: Tokens,
    /// `used / limit * 100`
    pub percentage: f64,
}

impl DimensionMetrics {
    pub(crate) fn from_bucket(bucket: &mut ResourceBucket, now: TimestampMs) -> Self {
        let available = bucket.available_at(now);
        let limit = bucket.capacity();
        let used = limit - available;
        Self {
            used,
            available,
            limit,
            percentage: used / limit * 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThrottleMetrics {
    pub rate: DimensionMetrics,
    pub volume: DimensionMetrics,
    /// Mean estimate accuracy over the recent reconciled records, 0.85 if none.
    pub efficiency: f64,
    pub compensation_debt: Tokens,
    pub ledger_size: usize,
}

/// Point-in-time capture of both buckets and the debt. The ledger is not
/// part of it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub rate: BucketState,
    pub volume: BucketState,
    pub compensation_debt: Tokens,
    pub taken_at_ms: TimestampMs,
}
