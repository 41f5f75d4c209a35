//! Engine construction parameters.

use serde::{Deserialize, Serialize};

use crate::cores::ResourceBucketConfig;
use crate::types::{TimestampMs, Tokens};
use crate::{ThrottleError, ThrottleResult};

pub const DEFAULT_MAX_RECORDS: usize = 10_000;
pub const DEFAULT_RETENTION_WINDOW_MS: TimestampMs = 60_000;
pub const DEFAULT_EFFICIENCY_WINDOW_SIZE: usize = 50;

/// What to do when reconciliation needs more volume than the bucket holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustmentStrategy {
    /// Fail the reconciliation with `AdmissionDenied`; the record is not updated.
    Strict,
    /// Log the shortfall and absorb it. Nothing is owed afterwards.
    #[default]
    Warn,
    /// Carry the shortfall as compensation debt charged to the next admission.
    Compensate,
}

/// Throttle engine configuration. Limits are per minute.
///
/// ```rust
/// use rate_guard_throttle::config::{AdjustmentStrategy, ThrottleConfig};
///
/// let config = ThrottleConfig::new(60.0, 90_000.0)
///     .with_volume_burst(120_000.0)
///     .with_adjustment_strategy(AdjustmentStrategy::Compensate);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Requests per minute.
    pub rate_limit: Tokens,
    /// Consumed units per minute.
    pub volume_limit: Tokens,
    /// Rate bucket capacity; defaults to `rate_limit`.
    pub rate_burst: Option<Tokens>,
    /// Volume bucket capacity; defaults to `volume_limit`.
    pub volume_burst: Option<Tokens>,
    pub adjustment_strategy: AdjustmentStrategy,
    /// Ledger size bound.
    pub max_records: usize,
    /// How long a record stays reconcilable.
    pub retention_window_ms: TimestampMs,
    /// Reconciled records averaged into the efficiency metric.
    pub efficiency_window_size: usize,
}

impl Default for ThrottleConfig {
    /// Zero limits; only meaningful as a serde base, `validate` rejects it.
    fn default() -> Self {
        Self::new(0.0, 0.0)
    }
}

impl ThrottleConfig {
    /// Per-minute limits with every other field at its default.
    pub fn new(rate_limit: Tokens, volume_limit: Tokens) -> Self {
        Self {
            rate_limit,
            volume_limit,
            rate_burst: None,
            volume_burst: None,
            adjustment_strategy: AdjustmentStrategy::default(),
            max_records: DEFAULT_MAX_RECORDS,
            retention_window_ms: DEFAULT_RETENTION_WINDOW_MS,
            efficiency_window_size: DEFAULT_EFFICIENCY_WINDOW_SIZE,
        }
    }

    /// Lets the rate bucket hold more than one minute's worth.
    pub fn with_rate_burst(mut self, burst: Tokens) -> Self {
        self.rate_burst = Some(burst);
        self
    }

    /// Lets the volume bucket hold more than one minute's worth.
    pub fn with_volume_burst(mut self, burst: Tokens) -> Self {
        self.volume_burst = Some(burst);
        self
    }

    /// Sets what happens when a reconciliation cannot be covered.
    pub fn with_adjustment_strategy(mut self, strategy: AdjustmentStrategy) -> Self {
        self.adjustment_strategy = strategy;
        self
    }

    /// Sets the ledger size bound.
    pub fn with_max_records(mut self, n: usize) -> Self {
        self.max_records = n;
        self
    }

    /// Sets how long records stay reconcilable.
    pub fn with_retention_window_ms(mut self, ms: TimestampMs) -> Self {
        self.retention_window_ms = ms;
        self
    }

    /// Sets how many reconciled records feed the efficiency metric.
    pub fn with_efficiency_window_size(mut self, n: usize) -> Self {
        self.efficiency_window_size = n;
        self
    }

    /// Checks every field and reports all problems at once.
    pub fn validate(&self) -> ThrottleResult<()> {
        let mut problems = Vec::new();

        check_limit(&mut problems, "rate limit", self.rate_limit, self.rate_burst, "rate burst");
        check_limit(
            &mut problems,
            "volume limit",
            self.volume_limit,
            self.volume_burst,
            "volume burst",
        );

        if self.max_records == 0 {
            problems.push("max records must be greater than 0".to_string());
        }
        if self.retention_window_ms == 0 {
            problems.push("retention window must be greater than 0 ms".to_string());
        }
        if self.efficiency_window_size == 0 {
            problems.push("efficiency window size must be greater than 0".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ThrottleError::Configuration(problems))
        }
    }

    pub fn rate_bucket(&self) -> ResourceBucketConfig {
        ResourceBucketConfig::per_minute(self.rate_limit, self.rate_burst)
    }

    pub fn volume_bucket(&self) -> ResourceBucketConfig {
        ResourceBucketConfig::per_minute(self.volume_limit, self.volume_burst)
    }
}

fn check_limit(
    problems: &mut Vec<String>,
    name: &str,
    limit: Tokens,
    burst: Option<Tokens>,
    burst_name: &str,
) {
    if !(limit.is_finite() && limit > 0.0) {
        problems.push(format!("{} must be greater than 0, got {}", name, limit));
        return;
    }
    if let Some(burst) = burst {
        if !burst.is_finite() || burst < limit {
            problems.push(format!(
                "{} must be at least the {} ({}), got {}",
                burst_name, name, limit, burst
            ));
        }
    }
}
