//! Admission control for metered resources under two simultaneous limits.
//!
//! A caller that wants to spend a metered resource (for example an API billed
//! both per request and per consumed token) asks the engine first. The engine
//! tracks two continuously refilling buckets, one for requests and one for
//! consumed units, and admits a request only when both can cover it. Because
//! the true consumption is often known only after the call, an admitted
//! request can later be reconciled with its actual amount and the engine
//! corrects the volume bucket retroactively.
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use rate_guard_throttle::{ThrottleConfig, ThrottleEngine};
//! use rate_guard_throttle::clock::ManualClock;
//!
//! // 60 requests and 1000 tokens per minute
//! let clock = ManualClock::new(0);
//! let mut engine: ThrottleEngine =
//!     ThrottleEngine::with_clock(ThrottleConfig::new(60.0, 1000.0), Arc::new(clock.clone())).unwrap();
//!
//! assert!(engine.consume("req-1", 500.0, None).unwrap());
//! // The call turned out cheaper than estimated
//! engine.adjust_consumption("req-1", 300.0).unwrap();
//! assert_eq!(engine.get_metrics().volume.used, 300.0);
//! ```
//!
//! # Components
//!
//! - [`ResourceBucket`](cores::ResourceBucket) - one continuously refilling bucket
//! - [`Gate`](gate::Gate) - FIFO async lock ordering concurrent mutations
//! - [`ThrottleEngine`] - admission, consumption and reconciliation
//! - [`SharedThrottle`] - the engine behind the gate, for concurrent callers
//! - [`ConsumptionLedger`](ledger::ConsumptionLedger) - bounded history and efficiency metrics
//! - [`persistence`] - best-effort checkpointing through a background worker
//!
//! # Reconciliation
//!
//! When a reconciliation needs more volume than is left, the
//! [`AdjustmentStrategy`] decides: `Strict` fails the call, `Warn` absorbs
//! the shortfall, `Compensate` charges it to the next admission as
//! compensation debt.
//!
//! # Error Handling
//!
//! Denied admission is a normal return value (`Ok(false)` or an
//! [`Admission`] with `allowed == false`). Only the `*_or_fail` variants turn
//! it into [`ThrottleError::AdmissionDenied`]. Persistence failures never
//! reach the caller.

pub mod clock;
pub mod config;
pub mod cores;
pub mod engine;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod persistence;
pub mod shared;
pub mod types;

pub use config::{AdjustmentStrategy, ThrottleConfig};
pub use engine::{Admission, Availability, DimensionMetrics, StateSnapshot, ThrottleEngine, ThrottleMetrics};
pub use error::{LimitReason, PersistenceError, ThrottleError, ThrottleResult};
pub use shared::SharedThrottle;
pub use types::{TimestampMs, Tokens};
