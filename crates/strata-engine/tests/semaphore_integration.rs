//! Semaphore behavior with real tasks

mod common;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_engine::{
    current_task, CancellationReason, Deadline, Semaphore, SuspendReason, TaskError, TaskState,
    WaitError,
};

#[test]
fn test_capacity_acquires_never_suspend() {
    let rt = common::runtime(1);
    for capacity in [1usize, 2, 5, 16] {
        let sem = Arc::new(Semaphore::new(capacity));
        let probe = sem.clone();
        let (held, extra) = rt
            .block_on(async move {
                // A passed deadline fails any acquire that would have to wait
                let mut held = Vec::new();
                for _ in 0..capacity {
                    held.push(probe.acquire(Deadline::passed()).await);
                }
                let extra = probe.acquire(Deadline::passed()).await;
                (held, extra.map(|p| p.owns_permit()))
            })
            .unwrap();
        assert!(held.iter().all(|p| p.as_ref().is_ok_and(|p| p.owns_permit())));
        assert_eq!(extra, Err(WaitError::DeadlineExceeded));
        assert_eq!(sem.used(), capacity);
        drop(held);
        assert_eq!(sem.used(), 0);
    }
}

#[test]
fn test_waiters_served_in_arrival_order() {
    let rt = common::runtime(2);
    let sem = Arc::new(Semaphore::new(1));
    let held = sem.try_acquire().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut tasks = Vec::new();
    for id in 0..5 {
        let sem_for_task = sem.clone();
        let order = order.clone();
        tasks.push(rt.spawn(async move {
            let permit = sem_for_task.acquire_unbounded().await.unwrap();
            order.lock().push(id);
            current_task::yield_now().await;
            drop(permit);
        }));
        assert!(common::wait_until(|| sem.waiters() == id + 1));
    }

    sem.release(held);
    for task in tasks {
        task.blocking_get().unwrap();
    }
    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    assert_eq!(sem.used(), 0);
}

#[test]
fn test_release_hands_permit_to_suspended_waiter() {
    let rt = common::runtime(2);
    let sem = Arc::new(Semaphore::new(1));
    let held = sem.try_acquire().unwrap();

    let waiter_sem = sem.clone();
    let waiter = rt.spawn(async move {
        let permit = waiter_sem.acquire_unbounded().await;
        permit.map(|p| p.owns_permit())
    });
    assert!(common::wait_until(|| waiter.state() == TaskState::Suspended));
    assert_eq!(waiter.suspend_reason(), Some(SuspendReason::Semaphore));

    drop(held);
    assert_eq!(waiter.blocking_get(), Ok(Ok(true)));
    assert_eq!(sem.used(), 0);
}

#[test]
fn test_cancel_during_acquire_does_not_leak() {
    let rt = common::runtime(1);
    let sem = Arc::new(Semaphore::new(1));
    let held = sem.try_acquire().unwrap();

    let (tx, rx) = crossbeam::channel::bounded(1);
    let waiter_sem = sem.clone();
    let waiter = rt.spawn(async move {
        let outcome = waiter_sem.acquire_unbounded().await;
        tx.send(outcome.map(|p| p.owns_permit())).unwrap();
    });
    assert!(common::wait_until(|| sem.waiters() == 1));

    waiter.request_cancel();
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        Err(WaitError::Cancelled(CancellationReason::UserRequest))
    );
    assert_eq!(
        waiter.blocking_get(),
        Err(TaskError::Cancelled(CancellationReason::UserRequest))
    );
    assert_eq!(sem.waiters(), 0);
    assert_eq!(sem.used(), 1);
    drop(held);
    assert_eq!(sem.used(), 0);
    assert!(sem.try_acquire().is_some());
}

#[test]
fn test_acquire_deadline_expires() {
    let rt = common::runtime(1);
    let sem = Arc::new(Semaphore::new(0));
    let probe = sem.clone();
    let (outcome, elapsed) = rt
        .block_on(async move {
            let started = Instant::now();
            let outcome = probe
                .acquire(Deadline::from_duration(Duration::from_millis(30)))
                .await
                .map(|p| p.owns_permit());
            (outcome, started.elapsed())
        })
        .unwrap();
    assert_eq!(outcome, Err(WaitError::DeadlineExceeded));
    assert!(elapsed >= Duration::from_millis(30));
    assert_eq!(sem.waiters(), 0);
}

#[test]
fn test_growing_capacity_wakes_waiters() {
    let rt = common::runtime(2);
    let sem = Arc::new(Semaphore::new(0));

    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let sem = sem.clone();
            rt.spawn(async move { sem.acquire_unbounded().await.is_ok() })
        })
        .collect();
    assert!(common::wait_until(|| sem.waiters() == 2));

    sem.set_capacity(2);
    for task in tasks {
        assert_eq!(task.blocking_get(), Ok(true));
    }
    assert_eq!(sem.used(), 0);
    assert_eq!(sem.capacity(), 2);
}

#[test]
fn test_permit_moves_out_of_task() {
    let rt = common::runtime(1);
    let sem = Arc::new(Semaphore::new(1));
    let probe = sem.clone();
    let permit = rt
        .block_on(async move { probe.acquire_unbounded().await })
        .unwrap()
        .unwrap();
    assert!(permit.owns_permit());
    assert_eq!(sem.used(), 1);
    assert!(sem.try_acquire().is_none());
    sem.release(permit);
    assert_eq!(sem.used(), 0);
}

#[test]
fn test_holders_never_exceed_capacity() {
    let rt = common::runtime(4);
    let sem = Arc::new(Semaphore::new(3));
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..100)
        .map(|_| {
            let sem = sem.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            rt.spawn(async move {
                let _permit = sem.acquire_unbounded().await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                current_task::yield_now().await;
                inside.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();

    for task in tasks {
        task.blocking_get().unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(peak.load(Ordering::SeqCst) >= 1);
    assert_eq!(sem.used(), 0);
    assert_eq!(sem.waiters(), 0);
}
