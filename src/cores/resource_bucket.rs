use serde::{Deserialize, Serialize};

use crate::types::{is_valid_amount, TimestampMs, Tokens};
use crate::{ThrottleError, ThrottleResult};

/// Continuously refilling token bucket for a single constrained dimension.
///
/// The bucket holds at most `capacity` units and regains `refill_rate` units
/// per second. Refill is lazy: every read or mutation first credits the time
/// elapsed since the last refill, so the balance is always
/// `min(capacity, available + elapsed_seconds * refill_rate)`.
///
/// All operations take the current time explicitly, which keeps the bucket a
/// pure state machine that can be driven by any clock.
///
/// # Algorithm Behavior
///
/// - The bucket starts with `initial_available` units (normally full)
/// - `consume_at` is all-or-nothing: a refused request leaves the balance untouched
/// - `refund_at` returns units, capped at capacity
/// - A timestamp older than the last refill counts as zero elapsed time
///
/// # Example
///
/// ```rust
/// use rate_guard_throttle::cores::{ResourceBucket, ResourceBucketConfig};
///
/// // 100 units, refilling 10 units per second
/// let mut bucket = ResourceBucket::new(ResourceBucketConfig::new(100.0, 10.0), 0).unwrap();
///
/// assert_eq!(bucket.consume_at(0, 50.0), Ok(true));
/// // Two seconds later 20 units have come back
/// assert_eq!(bucket.available_at(2_000), 70.0);
/// ```
#[derive(Debug, Clone)]
pub struct ResourceBucket {
    /// Maximum number of units the bucket can hold
    capacity: Tokens,
    /// Units regained per second
    refill_rate: Tokens,
    /// Current balance as of `last_refill_ms`
    available: Tokens,
    /// Time of the last refill computation
    last_refill_ms: TimestampMs,
}

/// Exported bucket state, used by snapshots and persistence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub available: Tokens,
    pub capacity: Tokens,
    pub last_refill_ms: TimestampMs,
}

impl ResourceBucket {
    /// Creates a bucket from its configuration at time `now`.
    ///
    /// # Errors
    ///
    /// Returns [`ThrottleError::Configuration`] listing every invalid field.
    pub fn new(config: ResourceBucketConfig, now: TimestampMs) -> ThrottleResult<Self> {
        let problems = config.problems("bucket");
        if !problems.is_empty() {
            return Err(ThrottleError::Configuration(problems));
        }

        Ok(ResourceBucket {
            capacity: config.capacity,
            refill_rate: config.refill_rate,
            available: config.initial_available.unwrap_or(config.capacity),
            last_refill_ms: now,
        })
    }

    /// Credits the units regained since the last refill.
    ///
    /// Idempotent for a fixed `now` and never lowers the balance. A `now`
    /// earlier than the last refill is treated as no elapsed time and does
    /// not move the refill timestamp backwards.
    #[inline]
    fn refill_at(&mut self, now: TimestampMs) {
        if now <= self.last_refill_ms {
            return;
        }

        let elapsed_secs = (now - self.last_refill_ms) as f64 / 1000.0;
        let refilled = elapsed_secs * self.refill_rate;
        self.available = (self.available + refilled).min(self.capacity);
        self.last_refill_ms = now;
    }

    /// Returns whether `tokens` units could be consumed at `now`.
    ///
    /// Negative or non-finite amounts are never satisfiable.
    pub fn has_capacity_at(&mut self, now: TimestampMs, tokens: Tokens) -> bool {
        if !is_valid_amount(tokens) {
            return false;
        }
        self.refill_at(now);
        self.available >= tokens
    }

    /// Attempts to take `tokens` units at `now`.
    ///
    /// # Returns
    /// * `Ok(true)` - The units were debited
    /// * `Ok(false)` - Not enough units; the balance is unchanged
    /// * `Err(ThrottleError::InvalidArgument)` - `tokens` is negative or not finite
    pub fn consume_at(&mut self, now: TimestampMs, tokens: Tokens) -> ThrottleResult<bool> {
        if !is_valid_amount(tokens) {
            return Err(ThrottleError::InvalidArgument(format!(
                "cannot consume {} tokens",
                tokens
            )));
        }

        self.refill_at(now);

        if tokens <= self.available {
            self.available -= tokens;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Returns `tokens` units to the bucket, capped at capacity.
    pub fn refund_at(&mut self, now: TimestampMs, tokens: Tokens) -> ThrottleResult<()> {
        if !is_valid_amount(tokens) {
            return Err(ThrottleError::InvalidArgument(format!(
                "cannot refund {} tokens",
                tokens
            )));
        }

        self.refill_at(now);
        self.available = (self.available + tokens).min(self.capacity);
        Ok(())
    }

    /// Milliseconds until `tokens` units will be available, `0` if they already are.
    ///
    /// An amount above capacity still yields the time the refill would take;
    /// the caller decides whether such a request can ever succeed.
    pub fn time_until_available_at(&mut self, now: TimestampMs, tokens: Tokens) -> TimestampMs {
        if !is_valid_amount(tokens) {
            return 0;
        }

        self.refill_at(now);

        if self.available >= tokens {
            return 0;
        }

        let needed = tokens - self.available;
        (needed / self.refill_rate * 1000.0).ceil() as TimestampMs
    }

    /// Current balance after refilling to `now`.
    pub fn available_at(&mut self, now: TimestampMs) -> Tokens {
        self.refill_at(now);
        self.available
    }

    /// Refills the bucket to capacity.
    pub fn reset_at(&mut self, now: TimestampMs) {
        self.available = self.capacity;
        self.last_refill_ms = self.last_refill_ms.max(now);
    }

    /// Maximum balance.
    #[inline]
    pub fn capacity(&self) -> Tokens {
        self.capacity
    }

    /// Units regained per second.
    #[inline]
    pub fn refill_rate(&self) -> Tokens {
        self.refill_rate
    }

    /// Exports the raw state without refilling.
    pub fn export_state(&self) -> BucketState {
        BucketState {
            available: self.available,
            capacity: self.capacity,
            last_refill_ms: self.last_refill_ms,
        }
    }

    /// Checks that `state` could be imported into this bucket.
    ///
    /// Rejects balances outside `[0, capacity]` and a capacity that differs
    /// from the live one, which means the bucket was reconfigured since the
    /// state was captured.
    pub fn validate_import(&self, state: &BucketState) -> ThrottleResult<()> {
        if state.capacity != self.capacity {
            return Err(ThrottleError::InvalidState(format!(
                "bucket capacity mismatch: stored {}, configured {}",
                state.capacity, self.capacity
            )));
        }
        if !state.available.is_finite() || state.available < 0.0 || state.available > state.capacity {
            return Err(ThrottleError::InvalidState(format!(
                "bucket balance {} outside [0, {}]",
                state.available, state.capacity
            )));
        }
        Ok(())
    }

    /// Replaces the live state with `state` after validating it.
    ///
    /// On error the bucket is left untouched.
    pub fn import_state(&mut self, state: BucketState) -> ThrottleResult<()> {
        self.validate_import(&state)?;
        self.available = state.available;
        self.last_refill_ms = state.last_refill_ms;
        Ok(())
    }

    /// Pure invariant check: `0 <= available <= capacity`, positive capacity and rate.
    pub fn check_consistency(&self) -> bool {
        self.available >= 0.0
            && self.available <= self.capacity
            && self.capacity > 0.0
            && self.refill_rate > 0.0
            && self.refill_rate.is_finite()
    }
}

/// Configuration structure for creating a [`ResourceBucket`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceBucketConfig {
    /// Maximum number of units the bucket can hold.
    pub capacity: Tokens,
    /// Units regained per second.
    pub refill_rate: Tokens,
    /// Starting balance; `None` starts the bucket full.
    pub initial_available: Option<Tokens>,
}

impl ResourceBucketConfig {
    /// Creates a configuration for a bucket that starts full.
    pub fn new(capacity: Tokens, refill_rate: Tokens) -> Self {
        Self {
            capacity,
            refill_rate,
            initial_available: None,
        }
    }

    /// Bucket for a per-minute limit with an optional burst ceiling.
    ///
    /// The bucket holds `burst.unwrap_or(limit)` units and refills at
    /// `limit / 60` units per second.
    pub fn per_minute(limit: Tokens, burst: Option<Tokens>) -> Self {
        Self::new(burst.unwrap_or(limit), limit / 60.0)
    }

    pub fn with_initial_available(mut self, available: Tokens) -> Self {
        self.initial_available = Some(available);
        self
    }

    pub(crate) fn problems(&self, name: &str) -> Vec<String> {
        let mut problems = Vec::new();
        if !(self.capacity.is_finite() && self.capacity > 0.0) {
            problems.push(format!("{} capacity must be greater than 0, got {}", name, self.capacity));
        }
        if !(self.refill_rate.is_finite() && self.refill_rate > 0.0) {
            problems.push(format!(
                "{} refill rate must be greater than 0, got {}",
                name, self.refill_rate
            ));
        }
        if let Some(initial) = self.initial_available {
            if !is_valid_amount(initial) || initial > self.capacity {
                problems.push(format!(
                    "{} initial balance {} outside [0, {}]",
                    name, initial, self.capacity
                ));
            }
        }
        problems
    }
}
