//! Numeric aliases shared by buckets, the ledger and the engine.
//!
//! Refill is continuous, so token balances are fractional and use [`f64`].
//! Time is expressed as whole milliseconds supplied by a [`Clock`](crate::clock::Clock).

/// Amount of a metered unit (requests or consumed tokens).
pub type Tokens = f64;

/// Milliseconds, either a point in time or a duration depending on context.
pub type TimestampMs = u64;

/// Returns `true` when `n` is a usable token amount: finite and not negative.
#[inline]
pub(crate) fn is_valid_amount(n: Tokens) -> bool {
    n.is_finite() && n >= 0.0
}
