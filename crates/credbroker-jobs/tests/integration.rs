//! Integration tests for the credbroker-jobs crate.
//!
//! These tests drive the scheduler through its timers and the
//! [`JobRegistry`] trait object the way job owners see it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use credbroker_jobs::{Job, JobRegistry, JobStatus, Scheduler};

fn counter_job(name: &str, interval: Duration, counter: &Arc<AtomicU32>) -> Job {
    let c = Arc::clone(counter);
    Job::new(name, "increments a counter", interval, move || {
        let c = Arc::clone(&c);
        async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

// ═══════════════════════════════════════════════════════════════════════
//  Timers
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn jobs_tick_on_their_interval() {
    let scheduler = Scheduler::new();
    let counter = Arc::new(AtomicU32::new(0));
    scheduler
        .register_job(counter_job("fast", Duration::from_millis(20), &counter))
        .unwrap();

    let handle = scheduler.start();
    tokio::time::sleep(Duration::from_millis(150)).await;
    scheduler.shutdown();
    handle.await.unwrap();

    let runs = counter.load(Ordering::SeqCst);
    assert!(runs >= 2, "expected several runs, got {runs}");
    assert_eq!(scheduler.job_info("fast").unwrap().runs, u64::from(runs));
}

#[tokio::test]
async fn job_registered_after_start_gets_a_timer() {
    let scheduler = Scheduler::new();
    let handle = scheduler.start();

    let counter = Arc::new(AtomicU32::new(0));
    scheduler
        .register_job(counter_job("late", Duration::from_millis(20), &counter))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    scheduler.shutdown();
    handle.await.unwrap();

    assert!(counter.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn slow_job_does_not_pile_up() {
    let scheduler = Scheduler::new();
    let counter = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&counter);
    scheduler
        .register_job(Job::new(
            "slow",
            "sleeps longer than its interval",
            Duration::from_millis(10),
            move || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(())
                }
            },
        ))
        .unwrap();

    let handle = scheduler.start();
    tokio::time::sleep(Duration::from_millis(150)).await;
    scheduler.shutdown();
    handle.await.unwrap();

    // Ten ticks fired, but each one landing while the job was pending was
    // dropped.
    assert!(counter.load(Ordering::SeqCst) <= 3);
}

// ═══════════════════════════════════════════════════════════════════════
//  Registry contract
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn registry_trait_object_registers_jobs() {
    let scheduler = Scheduler::new();
    let registry: Arc<dyn JobRegistry> = Arc::new(scheduler.clone());

    let counter = Arc::new(AtomicU32::new(0));
    registry
        .register_job(counter_job("a", Duration::from_secs(60), &counter))
        .unwrap();
    registry
        .register_job(counter_job("b", Duration::from_secs(60), &counter))
        .unwrap();

    let jobs = scheduler.all_jobs();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].name, "a");
    assert_eq!(jobs[1].name, "b");
    assert!(jobs.iter().all(|j| j.status == JobStatus::Idle));
}

#[tokio::test]
async fn failing_job_keeps_running_on_later_ticks() {
    let scheduler = Scheduler::new();
    let attempts = Arc::new(AtomicU32::new(0));
    let a = Arc::clone(&attempts);
    scheduler
        .register_job(Job::new(
            "flaky",
            "fails first, then succeeds",
            Duration::from_millis(20),
            move || {
                let a = Arc::clone(&a);
                async move {
                    if a.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err("first run fails".to_string())
                    } else {
                        Ok(())
                    }
                }
            },
        ))
        .unwrap();

    let handle = scheduler.start();
    tokio::time::sleep(Duration::from_millis(150)).await;
    scheduler.shutdown();
    handle.await.unwrap();

    let info = scheduler.job_info("flaky").unwrap();
    assert_eq!(info.failures, 1);
    assert!(info.runs >= 2);
    assert!(info.last_error.is_none());
}
