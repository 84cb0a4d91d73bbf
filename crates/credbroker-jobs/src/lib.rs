//! Recurring background jobs for credbroker.
//!
//! - **[`scheduler`]** -- the [`JobRegistry`] registration contract and a
//!   tokio-driven [`Scheduler`] that ticks each job on its own interval onto
//!   a lock-free [`crossbeam::queue::SegQueue`] drained by one worker.
//! - **[`error`]** -- scheduler error types via [`thiserror`].
//!
//! Components that need periodic work (lease renewal, key rewrapping) only
//! depend on [`JobRegistry`]; the binary owns the concrete [`Scheduler`].

pub mod error;
pub mod scheduler;

pub use error::{JobError, Result};
pub use scheduler::{Job, JobFn, JobInfo, JobRegistry, JobStatus, Scheduler};
