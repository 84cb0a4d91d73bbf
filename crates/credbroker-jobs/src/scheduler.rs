//! Lock-free recurring job scheduler.
//!
//! Jobs are registered once under a unique name with a fixed interval. When
//! the scheduler is started, every job gets a timer task that pushes the
//! job's name onto a [`crossbeam::queue::SegQueue`] at each tick; a single
//! background worker drains the queue and runs jobs one at a time.
//!
//! # Job lifecycle
//!
//! ```text
//! Idle  -->  Queued  -->  Running  -->  Idle
//! ```
//!
//! A tick that fires while the job is still `Queued` or `Running` is
//! dropped, so a slow job never piles up behind itself. A failed run is
//! recorded in [`JobInfo`] and the job simply runs again at its next tick.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{JobError, Result};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// The async body of a recurring job.
///
/// Called once per run; the returned future reports failure as a string so
/// job owners do not leak their error types into the scheduler.
pub type JobFn = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = std::result::Result<(), String>> + Send>>
        + Send
        + Sync,
>;

/// A named recurring job.
#[derive(Clone)]
pub struct Job {
    pub name: String,
    pub description: String,
    pub interval: Duration,
    pub run: JobFn,
}

impl Job {
    /// Build a job from an async closure.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        interval: Duration,
        run: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            interval,
            run: Arc::new(move || Box::pin(run())),
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// Registration contract for components that need periodic work.
pub trait JobRegistry: Send + Sync {
    /// Register `job`. Names are unique; a second registration under the
    /// same name fails with [`JobError::DuplicateJob`].
    fn register_job(&self, job: Job) -> Result<()>;
}

/// Where a job currently is in its run cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum JobStatus {
    /// Waiting for its next tick.
    Idle,
    /// On the run queue.
    Queued,
    /// Currently executing.
    Running,
}

/// Metadata snapshot of a job visible to external callers.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub name: String,
    pub description: String,
    pub interval: Duration,
    pub status: JobStatus,
    pub runs: u64,
    pub failures: u64,
    pub last_run_id: Option<Uuid>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Recurring job scheduler.
///
/// Cheaply cloneable (`Arc`-backed) and safe to share across threads and
/// async tasks.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    /// Names of jobs waiting to run.
    queue: SegQueue<String>,

    /// Registered job bodies keyed by name.
    jobs: DashMap<String, Job>,

    /// Authoritative job metadata.
    info: DashMap<String, JobInfo>,

    /// Wakes the background worker when new work arrives.
    notify: Notify,

    /// Set once [`Scheduler::start`] has run.
    started: AtomicBool,

    /// When `true` the scheduler will not accept new work.
    shutdown: AtomicBool,

    /// Per-job timer tasks, aborted on shutdown.
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a new scheduler **without** starting the background worker.
    ///
    /// Call [`Scheduler::start`] to spawn the worker and timers onto the
    /// tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                queue: SegQueue::new(),
                jobs: DashMap::new(),
                info: DashMap::new(),
                notify: Notify::new(),
                started: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                timers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the background worker and one timer per registered job.
    ///
    /// Jobs registered afterwards get their timer at registration. Returns a
    /// [`JoinHandle`] that resolves when the scheduler is shut down.
    pub fn start(&self) -> JoinHandle<()> {
        self.inner.started.store(true, Ordering::Release);

        let names: Vec<(String, Duration)> = self
            .inner
            .jobs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().interval))
            .collect();
        for (name, interval) in names {
            self.spawn_timer(name, interval);
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tracing::info!("scheduler worker started");
            Self::worker_loop(&inner).await;
            tracing::info!("scheduler worker stopped");
        })
    }

    /// Queue a registered job to run as soon as the worker is free.
    pub fn run_now(&self, name: &str) -> Result<()> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(JobError::SchedulerShutdown);
        }
        if !self.inner.jobs.contains_key(name) {
            return Err(JobError::JobNotFound {
                name: name.to_string(),
            });
        }
        Self::enqueue(&self.inner, name);
        Ok(())
    }

    /// Snapshot of one job's metadata.
    pub fn job_info(&self, name: &str) -> Result<JobInfo> {
        self.inner
            .info
            .get(name)
            .map(|entry| entry.clone())
            .ok_or_else(|| JobError::JobNotFound {
                name: name.to_string(),
            })
    }

    /// Snapshot of every registered job, sorted by name.
    pub fn all_jobs(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self
            .inner
            .info
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    /// Stop the timers and signal the worker to exit once the queue is
    /// drained of the job currently running (if any).
    pub fn shutdown(&self) {
        tracing::info!("scheduler shutdown requested");
        self.inner.shutdown.store(true, Ordering::Release);

        if let Ok(mut timers) = self.inner.timers.lock() {
            for timer in timers.drain(..) {
                timer.abort();
            }
        }
        self.inner.notify.notify_one();
    }

    // -- Private helpers ----------------------------------------------------

    fn spawn_timer(&self, name: String, interval: Duration) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if inner.shutdown.load(Ordering::Acquire) {
                    break;
                }
                Self::enqueue(&inner, &name);
            }
        });

        match self.inner.timers.lock() {
            Ok(mut timers) => timers.push(handle),
            Err(_) => handle.abort(),
        }
    }

    /// Move a job from `Idle` to `Queued` and push it onto the run queue.
    fn enqueue(inner: &SchedulerInner, name: &str) {
        if let Some(mut entry) = inner.info.get_mut(name) {
            if entry.status != JobStatus::Idle {
                tracing::debug!(job = name, status = ?entry.status, "job already pending, tick dropped");
                return;
            }
            entry.status = JobStatus::Queued;
        }
        inner.queue.push(name.to_string());
        inner.notify.notify_one();
    }

    /// Background worker loop.
    async fn worker_loop(inner: &SchedulerInner) {
        loop {
            match inner.queue.pop() {
                Some(name) => {
                    let Some(run) = inner.jobs.get(&name).map(|job| Arc::clone(&job.run)) else {
                        tracing::debug!(job = %name, "skipping unknown job");
                        continue;
                    };

                    let run_id = Uuid::now_v7();
                    if let Some(mut entry) = inner.info.get_mut(&name) {
                        entry.status = JobStatus::Running;
                        entry.last_run_id = Some(run_id);
                        entry.last_run = Some(Utc::now());
                    }

                    tracing::debug!(job = %name, %run_id, "job running");
                    let result = run().await;

                    if let Some(mut entry) = inner.info.get_mut(&name) {
                        entry.status = JobStatus::Idle;
                        entry.runs += 1;
                        match result {
                            Ok(()) => {
                                entry.last_error = None;
                                tracing::debug!(job = %name, %run_id, "job completed");
                            }
                            Err(err) => {
                                entry.failures += 1;
                                tracing::warn!(job = %name, %run_id, error = %err, "job failed");
                                entry.last_error = Some(err);
                            }
                        }
                    }
                }
                None => {
                    if inner.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    // Park until notified of new work or shutdown.
                    inner.notify.notified().await;

                    if inner.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                }
            }
        }
    }
}

impl JobRegistry for Scheduler {
    fn register_job(&self, job: Job) -> Result<()> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(JobError::SchedulerShutdown);
        }
        if job.name.trim().is_empty() {
            return Err(JobError::InvalidJob {
                name: job.name,
                reason: "name is empty".into(),
            });
        }
        if job.interval.is_zero() {
            return Err(JobError::InvalidJob {
                name: job.name,
                reason: "interval must be greater than zero".into(),
            });
        }

        let name = job.name.clone();
        let interval = job.interval;
        match self.inner.jobs.entry(name.clone()) {
            Entry::Occupied(_) => return Err(JobError::DuplicateJob { name }),
            Entry::Vacant(slot) => {
                self.inner.info.insert(
                    name.clone(),
                    JobInfo {
                        name: name.clone(),
                        description: job.description.clone(),
                        interval,
                        status: JobStatus::Idle,
                        runs: 0,
                        failures: 0,
                        last_run_id: None,
                        last_run: None,
                        last_error: None,
                    },
                );
                slot.insert(job);
            }
        }

        tracing::info!(job = %name, ?interval, "job registered");
        if self.inner.started.load(Ordering::Acquire) {
            self.spawn_timer(name, interval);
        }
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counting_job(name: &str, interval: Duration, counter: &Arc<AtomicU32>) -> Job {
        let c = Arc::clone(counter);
        Job::new(name, "counts runs", interval, move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn run_now_executes_job() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .register_job(counting_job("count", Duration::from_secs(3600), &counter))
            .unwrap();

        let handle = scheduler.start();
        scheduler.run_now("count").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let info = scheduler.job_info("count").unwrap();
        assert_eq!(info.runs, 1);
        assert_eq!(info.status, JobStatus::Idle);
        assert!(info.last_run.is_some());

        scheduler.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_name_rejected() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .register_job(counting_job("dup", Duration::from_secs(1), &counter))
            .unwrap();
        let result = scheduler.register_job(counting_job("dup", Duration::from_secs(1), &counter));
        assert!(matches!(result, Err(JobError::DuplicateJob { .. })));
    }

    #[tokio::test]
    async fn invalid_definitions_rejected() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        assert!(matches!(
            scheduler.register_job(counting_job("", Duration::from_secs(1), &counter)),
            Err(JobError::InvalidJob { .. })
        ));
        assert!(matches!(
            scheduler.register_job(counting_job("zero", Duration::ZERO, &counter)),
            Err(JobError::InvalidJob { .. })
        ));
    }

    #[tokio::test]
    async fn failure_is_recorded() {
        let scheduler = Scheduler::new();
        scheduler
            .register_job(Job::new("fail", "always fails", Duration::from_secs(3600), || async {
                Err("boom".to_string())
            }))
            .unwrap();

        let handle = scheduler.start();
        scheduler.run_now("fail").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let info = scheduler.job_info("fail").unwrap();
        assert_eq!(info.failures, 1);
        assert_eq!(info.last_error.as_deref(), Some("boom"));

        scheduler.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_job_and_shutdown() {
        let scheduler = Scheduler::new();
        assert!(matches!(
            scheduler.run_now("missing"),
            Err(JobError::JobNotFound { .. })
        ));
        assert!(scheduler.job_info("missing").is_err());

        scheduler.shutdown();
        let counter = Arc::new(AtomicU32::new(0));
        assert!(matches!(
            scheduler.register_job(counting_job("late", Duration::from_secs(1), &counter)),
            Err(JobError::SchedulerShutdown)
        ));
    }
}
