//! Integration tests for the delayed scheduler

use memocache::{CacheError, ShutdownPolicy, TimedExecutor};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

#[test]
fn test_task_fires_after_delay() {
    let executor = TimedExecutor::new(2).unwrap();
    let (tx, rx) = mpsc::channel();
    let delay = Duration::from_millis(100);

    let started = Instant::now();
    executor
        .execute_after(delay, move || {
            tx.send(Instant::now()).unwrap();
        })
        .unwrap();

    let fired_at = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let elapsed = fired_at.duration_since(started);
    assert!(elapsed >= delay, "fired early after {:?}", elapsed);
    assert!(elapsed < delay + Duration::from_millis(500), "fired late after {:?}", elapsed);
}

#[test]
fn test_cancelled_task_never_runs() {
    let executor = TimedExecutor::new(1).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    let task = {
        let runs = Arc::clone(&runs);
        executor
            .execute_after(Duration::from_millis(50), move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
    };
    assert!(task.is_pending());
    assert!(task.cancel());
    assert!(!task.is_pending());
    assert!(!task.cancel());

    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(executor.pending_count(), 0);
}

#[test]
fn test_earliest_due_runs_first_with_fifo_ties() {
    let executor = TimedExecutor::new(1).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    let due = Instant::now() + Duration::from_millis(80);

    let schedule = |label: &'static str, at: Instant| {
        let order = Arc::clone(&order);
        executor
            .execute_at(at, move || order.lock().push(label))
            .unwrap();
    };
    schedule("late", due + Duration::from_millis(40));
    schedule("tie-1", due);
    schedule("tie-2", due);
    schedule("early", due - Duration::from_millis(40));

    executor.shutdown(ShutdownPolicy::drain());
    assert_eq!(order.lock().as_slice(), &["early", "tie-1", "tie-2", "late"]);
}

#[test]
fn test_drain_runs_pending_immediately() {
    let executor = TimedExecutor::new(2).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let runs = Arc::clone(&runs);
        executor
            .execute_after(Duration::from_secs(3600), move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    let started = Instant::now();
    executor.shutdown(ShutdownPolicy::drain());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(runs.load(Ordering::SeqCst), 5);
}

#[test]
fn test_cancel_shutdown_discards_pending() {
    let executor = TimedExecutor::new(2).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let runs = Arc::clone(&runs);
        executor
            .execute_after(Duration::from_secs(3600), move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    executor.shutdown(ShutdownPolicy::cancel());
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert!(executor.is_shutdown());
    assert!(matches!(
        executor.execute_after(Duration::ZERO, || {}),
        Err(CacheError::ExecutorShutdown)
    ));
}

#[test]
fn test_shutdown_without_wait_returns_while_task_runs() {
    let executor = TimedExecutor::new(1).unwrap();
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    executor
        .execute_after(Duration::ZERO, move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        })
        .unwrap();
    started_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    executor.shutdown(ShutdownPolicy::drain().no_wait());
    assert_eq!(executor.running_count(), 1);

    release_tx.send(()).unwrap();
    executor.shutdown(ShutdownPolicy::drain());
    assert_eq!(executor.running_count(), 0);
}

#[test]
fn test_many_workers_run_tasks_in_parallel() {
    let executor = TimedExecutor::new(4).unwrap();
    let (tx, rx) = mpsc::channel();
    let started = Instant::now();

    for _ in 0..4 {
        let tx = tx.clone();
        executor
            .execute_after(Duration::ZERO, move || {
                std::thread::sleep(Duration::from_millis(200));
                tx.send(()).unwrap();
            })
            .unwrap();
    }
    for _ in 0..4 {
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }
    assert!(started.elapsed() < Duration::from_millis(700));
}
