use std::sync::{Arc, Mutex};

use rate_guard_throttle::gate::Gate;
use rate_guard_throttle::ThrottleError;

#[tokio::test]
async fn test_uncontended_acquire_is_immediate() {
    let gate = Gate::new();

    let guard = gate.acquire().await.unwrap();
    assert!(gate.is_locked());
    assert_eq!(gate.queue_len(), 0);

    guard.release().unwrap();
    assert!(!gate.is_locked());
}

#[tokio::test]
async fn test_waiters_are_granted_in_fifo_order() {
    let gate = Arc::new(Gate::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    let guard = gate.acquire().await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..5 {
        let task_gate = Arc::clone(&gate);
        let order = Arc::clone(&order);
        tasks.push(tokio::spawn(async move {
            task_gate.run_exclusive(|| async {
                order.lock().unwrap().push(i);
            })
            .await
        }));
        // Let task i enqueue before task i + 1 is spawned
        while gate.queue_len() < i + 1 {
            tokio::task::yield_now().await;
        }
    }

    drop(guard);
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert!(!gate.is_locked());
}

#[tokio::test]
async fn test_run_exclusive_releases_when_the_section_fails() {
    let gate = Gate::new();

    let result: Result<Result<(), &str>, _> = gate.run_exclusive(|| async { Err("boom") }).await;
    assert_eq!(result, Ok(Err("boom")));
    assert!(!gate.is_locked());

    // Still usable
    assert_eq!(gate.run_exclusive(|| async { 7 }).await, Ok(7));
}

#[tokio::test]
async fn test_run_exclusive_releases_when_the_section_panics() {
    let gate = Arc::new(Gate::new());

    let panicking = Arc::clone(&gate);
    let outcome = tokio::spawn(async move {
        panicking
            .run_exclusive(|| async { panic!("section failed") })
            .await
    })
    .await;
    assert!(outcome.is_err());

    assert!(!gate.is_locked());
}

#[tokio::test]
async fn test_drain_cancels_queued_waiters() {
    let gate = Arc::new(Gate::new());
    let guard = gate.acquire().await.unwrap();

    let waiter = {
        let gate = Arc::clone(&gate);
        tokio::spawn(async move { gate.acquire().await.map(|g| g.release()) })
    };
    while gate.queue_len() < 1 {
        tokio::task::yield_now().await;
    }

    assert_eq!(gate.drain(), 1);
    assert_eq!(waiter.await.unwrap().unwrap_err(), ThrottleError::Cancelled);
    assert!(!gate.is_locked());

    // The section running during the drain no longer owns the gate
    assert!(matches!(guard.release(), Err(ThrottleError::InvalidState(_))));
}

#[tokio::test]
async fn test_stale_guard_does_not_release_a_newer_holder() {
    let gate = Gate::new();
    let stale = gate.acquire().await.unwrap();
    gate.drain();

    let current = gate.acquire().await.unwrap();
    drop(stale);
    assert!(gate.is_locked());

    current.release().unwrap();
    assert!(!gate.is_locked());
}

#[tokio::test]
async fn test_dropped_waiter_is_skipped() {
    let gate = Arc::new(Gate::new());
    let guard = gate.acquire().await.unwrap();

    let abandoned = {
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            let _ = gate.acquire().await;
        })
    };
    while gate.queue_len() < 1 {
        tokio::task::yield_now().await;
    }
    abandoned.abort();
    let _ = abandoned.await;

    guard.release().unwrap();
    assert!(!gate.is_locked());
    assert!(gate.acquire().await.is_ok());
}

#[tokio::test]
async fn test_abandoned_waiters_are_not_counted() {
    let gate = Arc::new(Gate::new());
    let _guard = gate.acquire().await.unwrap();

    let abandoned = {
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            let _ = gate.acquire().await;
        })
    };
    let live = {
        let gate = Arc::clone(&gate);
        tokio::spawn(async move { gate.acquire().await.map(|g| g.release()) })
    };
    while gate.queue_len() < 2 {
        tokio::task::yield_now().await;
    }

    abandoned.abort();
    let _ = abandoned.await;
    assert_eq!(gate.queue_len(), 1);

    assert_eq!(gate.drain(), 1);
    assert_eq!(live.await.unwrap().unwrap_err(), ThrottleError::Cancelled);
}
