use std::sync::Arc;

use test_log::test;

use rate_guard_throttle::clock::ManualClock;
use rate_guard_throttle::ledger::DEFAULT_EFFICIENCY;
use rate_guard_throttle::{ThrottleConfig, ThrottleEngine, ThrottleError};

fn new_engine(config: ThrottleConfig) -> (ThrottleEngine, ManualClock) {
    let clock = ManualClock::new(1_000_000);
    let engine = ThrottleEngine::with_clock(config, Arc::new(clock.clone())).unwrap();
    (engine, clock)
}

fn roomy_config() -> ThrottleConfig {
    ThrottleConfig::new(6_000.0, 1_000_000.0)
}

#[test]
fn test_efficiency_defaults_when_nothing_is_reconciled() {
    let (mut engine, _) = new_engine(roomy_config());
    assert_eq!(engine.consume("a", 100.0, None), Ok(true));
    assert_eq!(engine.consume("b", 100.0, None), Ok(true));

    let metrics = engine.get_metrics();
    assert_eq!(metrics.efficiency, DEFAULT_EFFICIENCY);
    assert_eq!(metrics.efficiency, 0.85);
}

#[test]
fn test_efficiency_averages_reconciled_records() {
    let (mut engine, _) = new_engine(roomy_config());
    assert_eq!(engine.consume("a", 100.0, None), Ok(true));
    assert_eq!(engine.consume("b", 100.0, None), Ok(true));
    assert_eq!(engine.consume("pending", 100.0, None), Ok(true));

    engine.adjust_consumption("a", 50.0).unwrap(); // 0.5
    engine.adjust_consumption("b", 100.0).unwrap(); // 1.0

    assert_eq!(engine.get_metrics().efficiency, 0.75);
}

#[test]
fn test_efficiency_ratio_is_symmetric() {
    let (mut engine, _) = new_engine(roomy_config());
    assert_eq!(engine.consume("under", 100.0, None), Ok(true));
    engine.adjust_consumption("under", 200.0).unwrap();

    // min / max, so a 2x underestimate scores like a 2x overestimate
    assert_eq!(engine.get_metrics().efficiency, 0.5);
}

#[test]
fn test_efficiency_only_looks_at_the_recent_window() {
    let (mut engine, clock) = new_engine(roomy_config().with_efficiency_window_size(2));

    for (id, actual) in [("a", 25.0), ("b", 100.0), ("c", 100.0)] {
        assert_eq!(engine.consume(id, 100.0, None), Ok(true));
        engine.adjust_consumption(id, actual).unwrap();
        clock.advance(1);
    }

    // "a" falls outside the last two reconciled records
    assert_eq!(engine.get_metrics().efficiency, 1.0);
}

#[test]
fn test_stats_accuracy_defaults_to_one() {
    let (mut engine, _) = new_engine(roomy_config());
    assert_eq!(engine.consume("a", 100.0, None), Ok(true));

    let stats = engine.get_stats();
    assert_eq!(stats.total_records, 1);
    assert_eq!(stats.reconciled_records, 0);
    assert_eq!(stats.estimation_accuracy, 1.0);
    // Unlike efficiency
    assert_eq!(engine.get_metrics().efficiency, 0.85);
}

#[test]
fn test_stats_cover_the_whole_ledger() {
    let (mut engine, clock) = new_engine(roomy_config().with_efficiency_window_size(1));
    assert_eq!(engine.consume("a", 100.0, None), Ok(true));
    clock.advance(10);
    assert_eq!(engine.consume("b", 100.0, None), Ok(true));
    engine.adjust_consumption("a", 50.0).unwrap();
    engine.adjust_consumption("b", 100.0).unwrap();

    let stats = engine.get_stats();
    assert_eq!(stats.total_records, 2);
    assert_eq!(stats.reconciled_records, 2);
    assert_eq!(stats.total_estimated_tokens, 200.0);
    assert_eq!(stats.total_actual_tokens, 150.0);
    assert_eq!(stats.estimation_accuracy, 0.75);
    assert_eq!(stats.oldest_timestamp_ms, Some(1_000_000));
    assert_eq!(stats.newest_timestamp_ms, Some(1_000_010));
}

#[test]
fn test_ledger_keeps_only_the_newest_records() {
    let (mut engine, clock) = new_engine(roomy_config().with_max_records(10));

    for i in 0..50 {
        assert_eq!(engine.consume(&format!("r{}", i), 1.0, None), Ok(true));
        clock.advance(1);
    }

    let ids: Vec<String> = engine.get_history().iter().map(|r| r.request_id.clone()).collect();
    let expected: Vec<String> = (40..50).map(|i| format!("r{}", i)).collect();
    assert_eq!(ids, expected);
}

#[test]
fn test_shrinking_max_records_trims_immediately() {
    let (mut engine, _) = new_engine(roomy_config());
    for i in 0..30 {
        assert_eq!(engine.consume(&format!("r{}", i), 1.0, None), Ok(true));
    }

    engine.set_max_records(5).unwrap();

    let history = engine.get_history();
    assert_eq!(history.len(), 5);
    assert_eq!(history[0].request_id, "r25");
}

#[test]
fn test_records_age_out_of_the_retention_window() {
    let (mut engine, clock) = new_engine(roomy_config().with_retention_window_ms(1_000));
    assert_eq!(engine.consume("old", 1.0, None), Ok(true));
    clock.advance(500);
    assert_eq!(engine.consume("new", 1.0, None), Ok(true));

    // "old" is exactly one window old, which is already too old
    clock.advance(500);
    let history = engine.get_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].request_id, "new");
}

#[test]
fn test_shorter_retention_window_applies_at_once() {
    let (mut engine, clock) = new_engine(roomy_config());
    assert_eq!(engine.consume("a", 1.0, None), Ok(true));
    clock.advance(2_000);

    engine.set_retention_window(1_000).unwrap();
    assert_eq!(engine.get_metrics().ledger_size, 0);
}

#[test]
fn test_ledger_setters_reject_zero() {
    let (mut engine, _) = new_engine(roomy_config());

    assert!(matches!(engine.set_retention_window(0), Err(ThrottleError::InvalidArgument(_))));
    assert!(matches!(engine.set_max_records(0), Err(ThrottleError::InvalidArgument(_))));
}
