//! Shortfall handlers, one per [`AdjustmentStrategy`] variant.
//!
//! A handler runs when reconciliation needs `delta` more volume than the
//! bucket holds. The engine picks its handler once, at construction.

use log::{debug, warn};

use crate::config::AdjustmentStrategy;
use crate::types::{TimestampMs, Tokens};
use crate::{LimitReason, ThrottleError, ThrottleResult};

/// Everything a handler may look at or change.
pub(crate) struct Shortfall<'a> {
    pub request_id: &'a str,
    pub delta: Tokens,
    pub retry_after_ms: TimestampMs,
    pub debt: &'a mut Tokens,
}

/// `Err` aborts the reconciliation before the record is touched.
pub(crate) type ShortfallHandler = fn(Shortfall<'_>) -> ThrottleResult<()>;

impl AdjustmentStrategy {
    pub(crate) fn handler(self) -> ShortfallHandler {
        match self {
            AdjustmentStrategy::Strict => reject,
            AdjustmentStrategy::Warn => absorb,
            AdjustmentStrategy::Compensate => compensate,
        }
    }
}

fn reject(shortfall: Shortfall<'_>) -> ThrottleResult<()> {
    debug!(
        "rejecting reconciliation of '{}': {} more tokens unavailable",
        shortfall.request_id, shortfall.delta
    );
    Err(ThrottleError::AdmissionDenied {
        reason: LimitReason::VolumeLimit,
        retry_after_ms: shortfall.retry_after_ms,
    })
}

// Drops the shortfall: actual consumption may exceed the
// volume limit and nothing charges it back.
fn absorb(shortfall: Shortfall<'_>) -> ThrottleResult<()> {
    warn!(
        "request '{}' used {} tokens more than the volume bucket could cover, absorbing",
        shortfall.request_id, shortfall.delta
    );
    Ok(())
}

fn compensate(shortfall: Shortfall<'_>) -> ThrottleResult<()> {
    *shortfall.debt += shortfall.delta;
    debug!(
        "request '{}' short by {} tokens, compensation debt now {}",
        shortfall.request_id, shortfall.delta, shortfall.debt
    );
    Ok(())
}
