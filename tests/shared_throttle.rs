use std::sync::Arc;

use rate_guard_throttle::clock::ManualClock;
use rate_guard_throttle::{AdjustmentStrategy, LimitReason, SharedThrottle, ThrottleConfig, ThrottleEngine, ThrottleError};

fn shared(config: ThrottleConfig) -> Arc<SharedThrottle> {
    let clock = ManualClock::new(1_000_000);
    let engine = ThrottleEngine::with_clock(config, Arc::new(clock)).unwrap();
    Arc::new(SharedThrottle::new(engine))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_consumes_lose_no_updates() {
    const N: usize = 50;
    const UNIT: f64 = 10.0;
    let throttle = shared(ThrottleConfig::new(600.0, 1000.0));

    let tasks: Vec<_> = (0..N)
        .map(|i| {
            let throttle = Arc::clone(&throttle);
            tokio::spawn(async move { throttle.consume(format!("req-{}", i), UNIT, None).await })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap(), Ok(true));
    }

    let metrics = throttle.get_metrics();
    assert_eq!(metrics.volume.available, 1000.0 - N as f64 * UNIT);
    assert_eq!(metrics.rate.used, N as f64);
    assert_eq!(throttle.get_history().len(), N);
    assert!(throttle.validate_state());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_consumes_never_overdraw() {
    let throttle = shared(ThrottleConfig::new(600.0, 1000.0));

    let tasks: Vec<_> = (0..25)
        .map(|i| {
            let throttle = Arc::clone(&throttle);
            tokio::spawn(async move { throttle.consume(format!("req-{}", i), 100.0, None).await })
        })
        .collect();

    let mut admitted = 0;
    for task in tasks {
        if task.await.unwrap().unwrap() {
            admitted += 1;
        }
    }

    assert_eq!(admitted, 10);
    assert_eq!(throttle.get_metrics().volume.available, 0.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reconciliation() {
    let throttle = shared(ThrottleConfig::new(600.0, 1000.0));
    for i in 0..20 {
        assert_eq!(throttle.consume(format!("req-{}", i), 40.0, None).await, Ok(true));
    }

    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let throttle = Arc::clone(&throttle);
            tokio::spawn(async move { throttle.adjust_consumption(format!("req-{}", i), 25.0).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let metrics = throttle.get_metrics();
    assert_eq!(metrics.volume.used, 500.0);
    assert_eq!(metrics.efficiency, 25.0 / 40.0);
}

#[tokio::test]
async fn test_shared_surface_matches_the_engine() {
    let throttle = shared(
        ThrottleConfig::new(10.0, 100.0).with_adjustment_strategy(AdjustmentStrategy::Compensate),
    );

    assert!(throttle.can_process(100.0).unwrap().allowed);
    throttle.consume_or_fail("a", 100.0, None).await.unwrap();
    throttle.adjust_consumption("a", 110.0).await.unwrap();
    assert_eq!(throttle.compensation_debt(), 10.0);

    match throttle.consume_or_fail("b", 1.0, None).await {
        Err(ThrottleError::AdmissionDenied { reason, .. }) => assert_eq!(reason, LimitReason::VolumeLimit),
        other => panic!("Expected AdmissionDenied, got {:?}", other),
    }
    assert!(matches!(
        throttle.consume("a", 1.0, None).await,
        Err(ThrottleError::InvalidArgument(_))
    ));

    let snapshot = throttle.create_snapshot();
    throttle.reset().await.unwrap();
    assert_eq!(throttle.get_stats().total_records, 0);
    throttle.restore_from_snapshot(&snapshot).await.unwrap();
    assert_eq!(throttle.compensation_debt(), 10.0);

    throttle.set_max_records(1).await.unwrap();
    throttle.set_retention_window(1_000).await.unwrap();
    assert!(!throttle.repair_state().await.unwrap());

    let engine = Arc::try_unwrap(throttle).unwrap().into_inner();
    assert_eq!(engine.compensation_debt(), 10.0);
}

#[tokio::test]
async fn test_shutdown_cancels_queued_callers() {
    let throttle = shared(ThrottleConfig::new(60.0, 1000.0));
    assert_eq!(throttle.shutdown().await, 0);

    // Nothing queued: later calls still go through
    assert_eq!(throttle.consume("after", 1.0, None).await, Ok(true));
}
